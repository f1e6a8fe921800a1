//! Batch dispatch controller — drives one bulk send across many batches.
//!
//! The run loop is strictly sequential: batch N+1 is only requested after
//! batch N has been merged, because its offset comes from batch N's reply.
//! Every run is identified by a [`RunGeneration`]. `cancel()` moves the
//! controller to a new generation, so whatever the old loop receives later
//! is dropped before it can touch the published progress.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use schoolcast_core::error::{Result, SchoolCastError};
use schoolcast_core::traits::{DispatchApi, NotificationSink};
use schoolcast_core::types::{
    BatchProgress, DispatchParams, DispatchRequest, DispatchResult, Offset,
};
use tokio::sync::{mpsc, oneshot, watch};

use crate::backoff::{BackoffScheduler, BreakHandle};

/// Identifies one dispatch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunGeneration(u64);

impl RunGeneration {
    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Outcome of a run that reached its last batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub progress: BatchProgress,
    pub batches: u32,
    pub breaks_taken: u32,
}

#[derive(Default)]
struct RunState {
    generation: RunGeneration,
    running: bool,
    pending_break: Option<BreakHandle>,
}

impl RunState {
    fn owns(&self, generation: RunGeneration) -> bool {
        self.running && self.generation == generation
    }
}

struct Inner {
    api: Arc<dyn DispatchApi>,
    sink: Arc<dyn NotificationSink>,
    backoff: BackoffScheduler,
    request_timeout: Duration,
    state: Mutex<RunState>,
    progress: watch::Sender<BatchProgress>,
}

/// Cloneable handle to the controller; clones share one run state.
#[derive(Clone)]
pub struct DispatchController {
    inner: Arc<Inner>,
}

impl DispatchController {
    pub fn new(
        api: Arc<dyn DispatchApi>,
        sink: Arc<dyn NotificationSink>,
        backoff: BackoffScheduler,
        request_timeout: Duration,
    ) -> Self {
        let (progress, _) = watch::channel(BatchProgress::default());
        Self {
            inner: Arc::new(Inner {
                api,
                sink,
                backoff,
                request_timeout,
                state: Mutex::new(RunState::default()),
                progress,
            }),
        }
    }

    /// Read-only progress feed for observers.
    pub fn subscribe(&self) -> watch::Receiver<BatchProgress> {
        self.inner.progress.subscribe()
    }

    /// Current progress snapshot.
    pub fn progress(&self) -> BatchProgress {
        self.inner.progress.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    /// Run a bulk send to completion, starting at `offset`.
    ///
    /// Resolves to the final summary, to the fatal error that aborted the
    /// run, or to `Cancelled` when `cancel()` invalidated this run. Fails
    /// with `AlreadyRunning` without side effects if a run is live.
    /// Dropping the future ends the run and stops any pending break, but
    /// sends no notification.
    pub async fn start(&self, params: DispatchParams, offset: Offset) -> Result<RunSummary> {
        let generation = self.begin_run(&offset)?;
        let _release = RunRelease {
            controller: self,
            generation,
        };
        tracing::info!(
            "📨 Bulk send started: filter='{}' skip_sent={} offset={}",
            params.filter_key,
            params.skip_already_sent,
            offset
        );

        let mut progress = BatchProgress::starting_at(offset.clone());
        let mut offset = offset;
        let mut batches = 0u32;
        let mut breaks_taken = 0u32;

        loop {
            let request = DispatchRequest::new(&params, offset);
            tracing::debug!("📤 Batch {} at offset {}", batches + 1, request.offset);
            let response = self.dispatch_with_timeout(&request).await;

            if !self.lock_state().owns(generation) {
                tracing::debug!("🗑️ Dropping batch response for cancelled run {:?}", generation);
                return Err(SchoolCastError::Cancelled);
            }

            let result = match response {
                Ok(result) => result,
                Err(e) => return Err(self.abort_run(generation, progress, e)),
            };
            progress = match progress.merge(&result) {
                Ok(merged) => merged,
                Err(e) => return Err(self.abort_run(generation, progress, e)),
            };
            batches += 1;
            tracing::debug!(
                "📬 Batch {}: +{} sent, +{} failed, +{} skipped ({}/{})",
                batches,
                result.sent,
                result.failed,
                result.skipped,
                progress.processed(),
                progress.total_messages
            );

            if !result.has_more {
                return self.finish_run(generation, progress, batches, breaks_taken);
            }

            self.publish(generation, &progress)?;
            offset = progress.current_offset.clone();

            if result.needs_break {
                progress = self.take_break(generation, progress).await?;
                breaks_taken += 1;
            }
        }
    }

    /// Invalidate the live run, stop its break and reset progress.
    /// Returns `false` when no run was live.
    pub fn cancel(&self) -> bool {
        {
            let mut state = self.lock_state();
            if !state.running {
                return false;
            }
            state.generation = state.generation.next();
            state.running = false;
            if let Some(handle) = state.pending_break.take() {
                handle.cancel();
            }
            self.inner.progress.send_replace(BatchProgress::default());
        }
        tracing::info!("🛑 Bulk send cancelled");
        self.inner.sink.notify_warning("Bulk send cancelled");
        true
    }

    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_run(&self, offset: &Offset) -> Result<RunGeneration> {
        let mut state = self.lock_state();
        if state.running {
            return Err(SchoolCastError::AlreadyRunning);
        }
        state.generation = state.generation.next();
        state.running = true;
        state.pending_break = None;
        self.inner
            .progress
            .send_replace(BatchProgress::starting_at(offset.clone()));
        Ok(state.generation)
    }

    async fn dispatch_with_timeout(&self, request: &DispatchRequest) -> Result<DispatchResult> {
        let timeout = self.inner.request_timeout;
        match tokio::time::timeout(timeout, self.inner.api.dispatch_batch(request)).await {
            Ok(result) => result,
            Err(_) => Err(SchoolCastError::timeout(timeout)),
        }
    }

    /// Publish progress if `generation` still owns the controller.
    fn publish(&self, generation: RunGeneration, progress: &BatchProgress) -> Result<()> {
        let state = self.lock_state();
        if !state.owns(generation) {
            return Err(SchoolCastError::Cancelled);
        }
        self.inner.progress.send_replace(progress.clone());
        Ok(())
    }

    async fn take_break(
        &self,
        generation: RunGeneration,
        mut progress: BatchProgress,
    ) -> Result<BatchProgress> {
        let (tick_tx, mut tick_rx) = mpsc::unbounded_channel();
        let (elapsed_tx, mut elapsed_rx) = oneshot::channel();

        {
            let mut state = self.lock_state();
            if !state.owns(generation) {
                return Err(SchoolCastError::Cancelled);
            }
            let handle = self.inner.backoff.schedule(
                move |remaining| {
                    let _ = tick_tx.send(remaining);
                },
                move || {
                    let _ = elapsed_tx.send(());
                },
            );
            tracing::info!(
                "☕ Taking a {}s break after {} sends",
                handle.duration_secs(),
                progress.sent_messages
            );
            progress.is_on_break = true;
            progress.break_time_remaining = handle.duration_secs();
            self.inner.progress.send_replace(progress.clone());
            state.pending_break = Some(handle);
        }

        loop {
            tokio::select! {
                Some(remaining) = tick_rx.recv() => {
                    progress.break_time_remaining = remaining;
                    self.publish(generation, &progress)?;
                }
                elapsed = &mut elapsed_rx => {
                    // Sender dropped: the countdown was aborted by cancel().
                    if elapsed.is_err() {
                        return Err(SchoolCastError::Cancelled);
                    }
                    break;
                }
            }
        }

        {
            let mut state = self.lock_state();
            if !state.owns(generation) {
                return Err(SchoolCastError::Cancelled);
            }
            state.pending_break = None;
            progress.is_on_break = false;
            progress.break_time_remaining = 0;
            self.inner.progress.send_replace(progress.clone());
        }
        tracing::info!("▶️ Break over, resuming at offset {}", progress.current_offset);
        Ok(progress)
    }

    fn finish_run(
        &self,
        generation: RunGeneration,
        mut progress: BatchProgress,
        batches: u32,
        breaks_taken: u32,
    ) -> Result<RunSummary> {
        {
            let mut state = self.lock_state();
            if !state.owns(generation) {
                return Err(SchoolCastError::Cancelled);
            }
            state.running = false;
            state.pending_break = None;
            progress.is_completed = true;
            self.inner.progress.send_replace(progress.clone());
        }

        tracing::info!(
            "✅ Bulk send finished: {} sent, {} failed, {} skipped in {} batches ({} breaks)",
            progress.sent_messages,
            progress.failed_messages,
            progress.skipped_messages,
            batches,
            breaks_taken
        );
        self.inner.sink.notify_success(&format!(
            "Sent {} notifications ({} failed, {} skipped)",
            progress.sent_messages, progress.failed_messages, progress.skipped_messages
        ));

        Ok(RunSummary {
            progress,
            batches,
            breaks_taken,
        })
    }

    /// End the run on a fatal error, keeping the partial progress visible.
    fn abort_run(
        &self,
        generation: RunGeneration,
        mut progress: BatchProgress,
        error: SchoolCastError,
    ) -> SchoolCastError {
        {
            let mut state = self.lock_state();
            if !state.owns(generation) {
                return SchoolCastError::Cancelled;
            }
            state.running = false;
            if let Some(handle) = state.pending_break.take() {
                handle.cancel();
            }
            progress.is_on_break = false;
            progress.break_time_remaining = 0;
            self.inner.progress.send_replace(progress.clone());
        }

        tracing::warn!(
            "❌ Bulk send aborted after {} sent: {}",
            progress.sent_messages,
            error
        );
        self.inner.sink.notify_failure(&format!(
            "Bulk send stopped after {} sent: {error}",
            progress.sent_messages
        ));
        error
    }
}

/// Frees the controller when a run's future is dropped before the run ends.
/// A run that finished, aborted or was cancelled no longer owns the state,
/// so this is a no-op for it.
struct RunRelease<'a> {
    controller: &'a DispatchController,
    generation: RunGeneration,
}

impl Drop for RunRelease<'_> {
    fn drop(&mut self) {
        let mut state = self.controller.lock_state();
        if !state.owns(self.generation) {
            return;
        }
        state.running = false;
        if let Some(handle) = state.pending_break.take() {
            handle.cancel();
        }
        tracing::debug!("🧹 Bulk send {:?} dropped before completion", self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BreakWindow;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use tokio::time::Instant;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(&'static str, String)>>,
    }

    impl RecordingSink {
        fn count(&self, kind: &str) -> usize {
            self.events.lock().unwrap().iter().filter(|(k, _)| *k == kind).count()
        }
    }

    impl NotificationSink for RecordingSink {
        fn notify_success(&self, summary: &str) {
            self.events.lock().unwrap().push(("success", summary.to_string()));
        }
        fn notify_failure(&self, reason: &str) {
            self.events.lock().unwrap().push(("failure", reason.to_string()));
        }
        fn notify_warning(&self, message: &str) {
            self.events.lock().unwrap().push(("warning", message.to_string()));
        }
    }

    /// Replays a fixed list of responses, recording every request offset.
    struct ScriptedApi {
        responses: Mutex<VecDeque<Result<DispatchResult>>>,
        offsets: Mutex<Vec<String>>,
    }

    impl ScriptedApi {
        fn new(responses: Vec<Result<DispatchResult>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                offsets: Mutex::default(),
            })
        }

        fn offsets(&self) -> Vec<String> {
            self.offsets.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DispatchApi for ScriptedApi {
        async fn dispatch_batch(&self, request: &DispatchRequest) -> Result<DispatchResult> {
            self.offsets.lock().unwrap().push(request.offset.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(SchoolCastError::Network("script exhausted".into())))
        }
    }

    /// Holds every request until `release` is notified.
    struct GatedApi {
        release: Notify,
        calls: AtomicUsize,
        reply: DispatchResult,
    }

    #[async_trait]
    impl DispatchApi for GatedApi {
        async fn dispatch_batch(&self, _request: &DispatchRequest) -> Result<DispatchResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(self.reply.clone())
        }
    }

    struct HangingApi;

    #[async_trait]
    impl DispatchApi for HangingApi {
        async fn dispatch_batch(&self, _request: &DispatchRequest) -> Result<DispatchResult> {
            std::future::pending().await
        }
    }

    fn batch(sent: u64, next: &str, has_more: bool, needs_break: bool) -> DispatchResult {
        DispatchResult {
            total_eligible: 45,
            sent,
            failed: 0,
            skipped: 0,
            next_offset: Some(Offset::from(next)),
            has_more,
            needs_break,
        }
    }

    fn controller(api: Arc<dyn DispatchApi>, sink: Arc<RecordingSink>) -> DispatchController {
        DispatchController::new(
            api,
            sink,
            BackoffScheduler::default(),
            Duration::from_secs(30),
        )
    }

    fn params() -> DispatchParams {
        DispatchParams::new("all", true)
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_run_with_two_breaks() {
        let api = ScriptedApi::new(vec![
            Ok(batch(20, "20", true, true)),
            Ok(batch(20, "40", true, true)),
            Ok(batch(5, "45", false, false)),
        ]);
        let sink = Arc::new(RecordingSink::default());
        let ctl = controller(api.clone(), sink.clone());

        let begin = Instant::now();
        let summary = ctl.start(params(), Offset::start()).await.unwrap();
        let waited = begin.elapsed().as_secs();

        assert_eq!(summary.progress.sent_messages, 45);
        assert_eq!(summary.progress.total_messages, 45);
        assert!(summary.progress.is_completed);
        assert!(!summary.progress.is_on_break);
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.breaks_taken, 2);
        assert!((240..=362).contains(&waited), "waited {waited}s");

        assert_eq!(api.offsets(), vec!["0", "20", "40"]);
        assert_eq!(sink.count("success"), 1);
        assert_eq!(sink.count("failure"), 0);
        assert!(sink.events.lock().unwrap()[0].1.contains("45"));
        assert_eq!(ctl.progress(), summary.progress);
        assert!(!ctl.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_break_means_no_delay() {
        let api = ScriptedApi::new(vec![
            Ok(batch(20, "20", true, false)),
            Ok(batch(20, "40", true, false)),
            Ok(batch(5, "45", false, false)),
        ]);
        let sink = Arc::new(RecordingSink::default());
        let ctl = controller(api, sink);

        let begin = Instant::now();
        let summary = ctl.start(params(), Offset::start()).await.unwrap();
        assert_eq!(begin.elapsed(), Duration::ZERO);
        assert_eq!(summary.breaks_taken, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_batch_never_breaks() {
        let api = ScriptedApi::new(vec![
            Ok(batch(20, "20", true, false)),
            Ok(batch(20, "40", false, true)),
        ]);
        let sink = Arc::new(RecordingSink::default());
        let ctl = controller(api, sink.clone());

        let begin = Instant::now();
        let summary = ctl.start(params(), Offset::start()).await.unwrap();
        assert_eq!(summary.breaks_taken, 0);
        assert_eq!(begin.elapsed(), Duration::ZERO);
        assert_eq!(sink.count("success"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_from_offset() {
        let api = ScriptedApi::new(vec![Ok(batch(5, "45", false, false))]);
        let sink = Arc::new(RecordingSink::default());
        let ctl = controller(api.clone(), sink);

        ctl.start(params(), Offset::from("40")).await.unwrap();
        assert_eq!(api.offsets(), vec!["40"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failure_keeps_partial_progress() {
        let api = ScriptedApi::new(vec![
            Ok(batch(20, "20", true, false)),
            Err(SchoolCastError::Network("connection reset".into())),
        ]);
        let sink = Arc::new(RecordingSink::default());
        let ctl = controller(api.clone(), sink.clone());

        let err = ctl.start(params(), Offset::start()).await.unwrap_err();
        assert!(matches!(err, SchoolCastError::Network(_)));

        let progress = ctl.progress();
        assert_eq!(progress.sent_messages, 20);
        assert_eq!(progress.current_offset.as_str(), "20");
        assert!(!progress.is_completed);
        assert!(!progress.is_on_break);
        assert_eq!(sink.count("failure"), 1);
        assert_eq!(sink.count("success"), 0);
        assert!(!ctl.is_running());
        // no automatic retry
        assert_eq!(api.offsets().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inconsistent_counts_abort_run() {
        let mut bad = batch(20, "20", true, false);
        bad.failed = 40;
        let api = ScriptedApi::new(vec![Ok(bad)]);
        let sink = Arc::new(RecordingSink::default());
        let ctl = controller(api, sink.clone());

        let err = ctl.start(params(), Offset::start()).await.unwrap_err();
        assert!(matches!(err, SchoolCastError::Validation(_)));
        assert_eq!(ctl.progress().processed(), 0);
        assert_eq!(sink.count("failure"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_fatal() {
        let sink = Arc::new(RecordingSink::default());
        let ctl = DispatchController::new(
            Arc::new(HangingApi),
            sink.clone(),
            BackoffScheduler::default(),
            Duration::from_secs(5),
        );

        let err = ctl.start(params(), Offset::start()).await.unwrap_err();
        assert!(matches!(err, SchoolCastError::Network(_)));
        assert_eq!(sink.count("failure"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_break() {
        let api = ScriptedApi::new(vec![
            Ok(batch(20, "20", true, true)),
            Ok(batch(25, "45", false, false)),
        ]);
        let sink = Arc::new(RecordingSink::default());
        let ctl = controller(api.clone(), sink.clone());
        let mut feed = ctl.subscribe();

        let run = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.start(params(), Offset::start()).await }
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        let during = feed.borrow_and_update().clone();
        assert!(during.is_on_break);
        assert_eq!(during.sent_messages, 20);
        assert!((89..=151).contains(&during.break_time_remaining));

        assert!(ctl.cancel());
        let outcome = run.await.unwrap();
        assert!(matches!(outcome, Err(SchoolCastError::Cancelled)));
        assert_eq!(ctl.progress(), BatchProgress::default());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(api.offsets(), vec!["0"]);
        assert_eq!(ctl.progress(), BatchProgress::default());
        assert_eq!(sink.count("warning"), 1);
        assert_eq!(sink.count("success"), 0);
        // second cancel is a no-op
        assert!(!ctl.cancel());
        assert_eq!(sink.count("warning"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_request_in_flight() {
        let api = Arc::new(GatedApi {
            release: Notify::new(),
            calls: AtomicUsize::new(0),
            reply: batch(20, "20", true, false),
        });
        let sink = Arc::new(RecordingSink::default());
        let ctl = controller(api.clone(), sink.clone());
        let generation_before = ctl.lock_state().generation;

        let run = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.start(params(), Offset::start()).await }
        });
        while api.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let second = ctl.start(params(), Offset::start()).await;
        assert!(matches!(second, Err(SchoolCastError::AlreadyRunning)));

        assert!(ctl.cancel());
        assert!(ctl.lock_state().generation > generation_before);
        api.release.notify_one();

        let outcome = run.await.unwrap();
        assert!(matches!(outcome, Err(SchoolCastError::Cancelled)));
        assert_eq!(ctl.progress(), BatchProgress::default());
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.count("success"), 0);
        assert_eq!(sink.count("failure"), 0);
        assert!(!ctl.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_run_frees_controller() {
        let sink = Arc::new(RecordingSink::default());
        let ctl = DispatchController::new(
            Arc::new(HangingApi),
            sink.clone(),
            BackoffScheduler::default(),
            Duration::from_secs(5),
        );

        let run = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.start(params(), Offset::start()).await }
        });
        while !ctl.is_running() {
            tokio::task::yield_now().await;
        }
        run.abort();
        assert!(run.await.unwrap_err().is_cancelled());
        assert!(!ctl.is_running());

        // a fresh run starts instead of hitting AlreadyRunning
        let second = ctl.start(params(), Offset::start()).await;
        assert!(matches!(second, Err(SchoolCastError::Network(_))));
        assert!(!ctl.cancel());
        assert_eq!(sink.count("warning"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_run_stops_its_break() {
        let api = ScriptedApi::new(vec![
            Ok(batch(20, "20", true, true)),
            Ok(batch(25, "45", false, false)),
        ]);
        let sink = Arc::new(RecordingSink::default());
        let ctl = controller(api.clone(), sink.clone());
        let mut feed = ctl.subscribe();

        let run = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.start(params(), Offset::start()).await }
        });
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(feed.borrow_and_update().is_on_break);

        run.abort();
        let _ = run.await;
        assert!(!ctl.is_running());
        assert!(ctl.lock_state().pending_break.is_none());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(api.offsets(), vec!["0"]);
        assert_eq!(sink.count("success"), 0);
    }
}
