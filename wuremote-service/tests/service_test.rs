//! Integration tests for the service facade.
//!
//! These tests drive `WuRemoteService` against a manually driven mock agent
//! and observe it the way a connected client would.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use wuremote_agent::{AgentUpdate, JobKind, JobOutcome, JobProgress, MockAgent, MockMode};
use wuremote_service::broadcast::{CallbackEvent, DeliveryError, Liveness, Observer};
use wuremote_service::update::{Failure, Phase, ServiceError, Settings, WuState, MAX_TIMEOUT_SECS};
use wuremote_service::{ServiceOptions, WuRemoteService};

// ============================================================================
// Helpers
// ============================================================================

/// Observer recording every delivered event.
struct Recorder {
    events: Mutex<Vec<CallbackEvent>>,
    notify: Notify,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.name()).collect()
    }

    fn count(&self, name: &str) -> usize {
        self.names().into_iter().filter(|n| *n == name).count()
    }

    fn completions(&self) -> Vec<WuState> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                CallbackEvent::AsyncOperationCompleted { state, .. } => Some(state.clone()),
                _ => None,
            })
            .collect()
    }

    async fn wait_for(&self, name: &str, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.count(name) < count {
                self.notify.notified().await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{name} not delivered {count} times"));
    }
}

#[async_trait]
impl Observer for Recorder {
    fn id(&self) -> &str {
        "recorder"
    }

    fn liveness(&self) -> Liveness {
        Liveness::Open
    }

    async fn deliver(&self, event: CallbackEvent) -> Result<(), DeliveryError> {
        self.events.lock().unwrap().push(event);
        self.notify.notify_one();
        Ok(())
    }
}

/// Observer whose every delivery fails.
struct Broken;

#[async_trait]
impl Observer for Broken {
    fn id(&self) -> &str {
        "broken"
    }

    fn liveness(&self) -> Liveness {
        Liveness::Open
    }

    async fn deliver(&self, _event: CallbackEvent) -> Result<(), DeliveryError> {
        Err(DeliveryError::Failed("connection reset".into()))
    }
}

fn service_with(catalog: Vec<AgentUpdate>, settings: Settings) -> (Arc<MockAgent>, WuRemoteService) {
    let agent = Arc::new(MockAgent::manual(catalog));
    let options = ServiceOptions {
        settings,
        ..ServiceOptions::default()
    };
    let service = WuRemoteService::new(agent.clone(), options);
    (agent, service)
}

fn service() -> (Arc<MockAgent>, WuRemoteService) {
    service_with(MockAgent::sample_catalog(3), Settings::default())
}

async fn wait_for_state(service: &WuRemoteService, expected: &WuState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while service.get_wu_status().state != *expected {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "state {expected} not reached, still {}",
            service.get_wu_status().state
        )
    });
}

fn ids(agent: &MockAgent) -> Vec<String> {
    agent.catalog().into_iter().map(|u| u.id).collect()
}

async fn complete_search(agent: &MockAgent, service: &WuRemoteService) {
    agent
        .last_job()
        .unwrap()
        .complete(JobOutcome::succeeded(JobKind::Search).with_updates(agent.catalog()));
    wait_for_state(service, &WuState::SearchCompleted).await;
}

/// Bring a fresh service into `target`, with every update selected.
async fn drive_to(target: &WuState) -> (Arc<MockAgent>, WuRemoteService) {
    let (agent, service) = service();
    if *target == WuState::Ready {
        return (agent, service);
    }

    service.begin_search_updates().await.unwrap();
    match target {
        WuState::Searching => return (agent, service),
        WuState::SearchFailed(_) => {
            service.abort_search_updates().await.unwrap();
            agent
                .last_job()
                .unwrap()
                .complete(JobOutcome::aborted(JobKind::Search));
            wait_for_state(&service, target).await;
            return (agent, service);
        }
        _ => {}
    }

    complete_search(&agent, &service).await;
    service.select_all_updates().await;
    if *target == WuState::SearchCompleted {
        return (agent, service);
    }

    service.begin_download_updates().await.unwrap();
    match target {
        WuState::Downloading => return (agent, service),
        WuState::DownloadFailed(_) => {
            service.abort_download_updates().await.unwrap();
            agent
                .last_job()
                .unwrap()
                .complete(JobOutcome::aborted(JobKind::Download));
            wait_for_state(&service, target).await;
            return (agent, service);
        }
        _ => {}
    }
    agent
        .last_job()
        .unwrap()
        .complete(JobOutcome::succeeded(JobKind::Download).with_results_for(&ids(&agent)));
    wait_for_state(&service, &WuState::DownloadCompleted).await;
    if *target == WuState::DownloadCompleted {
        return (agent, service);
    }

    service.begin_install_updates().await.unwrap();
    match target {
        WuState::Installing => return (agent, service),
        WuState::InstallFailed(_) => {
            service.abort_install_updates().await.unwrap();
            agent
                .last_job()
                .unwrap()
                .complete(JobOutcome::aborted(JobKind::Install));
            wait_for_state(&service, target).await;
            return (agent, service);
        }
        _ => {}
    }
    let outcome = JobOutcome::succeeded(JobKind::Install).with_results_for(&ids(&agent));
    let outcome = if *target == WuState::RebootRequired {
        outcome.with_reboot_required()
    } else {
        outcome
    };
    agent.last_job().unwrap().complete(outcome);
    wait_for_state(&service, target).await;
    (agent, service)
}

// ============================================================================
// Properties
// ============================================================================

#[tokio::test]
async fn test_begin_succeeds_iff_state_allows_phase() {
    let states = [
        WuState::Ready,
        WuState::Searching,
        WuState::SearchCompleted,
        WuState::SearchFailed(Failure::Aborted),
        WuState::Downloading,
        WuState::DownloadCompleted,
        WuState::DownloadFailed(Failure::Aborted),
        WuState::Installing,
        WuState::InstallCompleted,
        WuState::InstallFailed(Failure::Aborted),
        WuState::RebootRequired,
    ];

    for state in &states {
        for phase in Phase::ALL {
            let (_agent, service) = drive_to(state).await;
            let result = match phase {
                Phase::Search => service.begin_search_updates().await,
                Phase::Download => service.begin_download_updates().await,
                Phase::Install => service.begin_install_updates().await,
            };

            if state.can_enter(phase) {
                match result {
                    Ok(entered) => assert_eq!(entered, phase.active_state(), "{state} -> {phase}"),
                    // Selected updates are not downloaded yet.
                    Err(ServiceError::PreconditionNotFulfilled { .. }) => {
                        assert_eq!((state, phase), (&WuState::SearchCompleted, Phase::Install));
                        assert_eq!(service.get_wu_status().state, *state);
                    }
                    Err(e) => panic!("{state} -> {phase}: {e}"),
                }
            } else {
                let err = result.unwrap_err();
                assert!(
                    matches!(err, ServiceError::InvalidTransition { .. }),
                    "{state} -> {phase}: {err}"
                );
                assert_eq!(service.get_wu_status().state, *state);
            }
        }
    }
}

#[tokio::test]
async fn test_search_after_download_needs_reset() {
    for target in [
        WuState::DownloadCompleted,
        WuState::DownloadFailed(Failure::Aborted),
        WuState::InstallFailed(Failure::Aborted),
    ] {
        let (_agent, service) = drive_to(&target).await;

        let err = service.begin_search_updates().await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition { .. }), "{target}: {err}");
        assert_eq!(service.get_wu_status().state, target);

        assert_eq!(service.reset_service().await.unwrap(), WuState::Ready);
        assert_eq!(service.begin_search_updates().await.unwrap(), WuState::Searching);
    }
}

#[tokio::test]
async fn test_abort_of_inactive_phase_is_noop() {
    let (agent, service) = drive_to(&WuState::SearchCompleted).await;

    for _ in 0..3 {
        assert_eq!(
            service.abort_download_updates().await.unwrap(),
            WuState::SearchCompleted
        );
        assert_eq!(
            service.abort_search_updates().await.unwrap(),
            WuState::SearchCompleted
        );
    }
    assert_eq!(agent.last_job().unwrap().abort_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_transitions_once() {
    let mut settings = Settings::default();
    settings.download_timeout_secs = 30;
    let (agent, service) = service_with(MockAgent::sample_catalog(2), settings);
    let observer = Recorder::new();
    service.register_for_callback(observer.clone());

    service.begin_search_updates().await.unwrap();
    complete_search(&agent, &service).await;
    service.select_all_updates().await;
    service.begin_download_updates().await.unwrap();

    let expected = WuState::DownloadFailed(Failure::TimedOut { after_secs: 30 });
    wait_for_state(&service, &expected).await;
    observer.wait_for("async_operation_completed", 2).await;

    let job = agent.last_job().unwrap();
    assert_eq!(job.abort_requests(), 1);

    // The agent acknowledges the abort late; nothing else may happen.
    job.complete(JobOutcome::aborted(JobKind::Download));
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(observer.count("async_operation_completed"), 2);
    assert_eq!(service.get_wu_status().state, expected);
}

#[tokio::test(start_paused = true)]
async fn test_completion_racing_timer_resolves_once() {
    for completion_first in [true, false] {
        let mut settings = Settings::default();
        settings.search_timeout_secs = 10;
        let (agent, service) = service_with(MockAgent::sample_catalog(1), settings);
        let observer = Recorder::new();
        service.register_for_callback(observer.clone());

        service.begin_search_updates().await.unwrap();
        let job = agent.last_job().unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        if completion_first {
            job.complete(JobOutcome::succeeded(JobKind::Search).with_updates(agent.catalog()));
        } else {
            tokio::task::yield_now().await;
            job.complete(JobOutcome::succeeded(JobKind::Search).with_updates(agent.catalog()));
        }

        observer.wait_for("async_operation_completed", 1).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        let completions = observer.completions();
        assert_eq!(completions.len(), 1, "completion_first={completion_first}");
        assert_eq!(service.get_wu_status().state, completions[0]);
        assert!(job.abort_requests() <= 1);
        match &completions[0] {
            WuState::SearchCompleted => assert_eq!(job.abort_requests(), 0),
            WuState::SearchFailed(Failure::TimedOut { .. }) => assert_eq!(job.abort_requests(), 1),
            other => panic!("unexpected terminal state {other}"),
        }
    }
}

#[tokio::test]
async fn test_double_completion_is_suppressed() {
    let (agent, service) = service();
    let observer = Recorder::new();
    service.register_for_callback(observer.clone());

    service.begin_search_updates().await.unwrap();
    let job = agent.last_job().unwrap();
    job.complete(JobOutcome::succeeded(JobKind::Search).with_updates(agent.catalog()));
    job.complete(JobOutcome::failed(JobKind::Search, -1));

    wait_for_state(&service, &WuState::SearchCompleted).await;
    observer.wait_for("async_operation_completed", 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(observer.completions(), vec![WuState::SearchCompleted]);
}

#[tokio::test]
async fn test_reset_isolates_old_job() {
    let (agent, service) = service();
    let observer = Recorder::new();
    service.register_for_callback(observer.clone());

    service.begin_search_updates().await.unwrap();
    let old_job = agent.last_job().unwrap();

    assert_eq!(service.reset_service().await.unwrap(), WuState::Ready);
    assert!(old_job.was_cleaned_up());
    observer.wait_for("state_changed", 2).await;

    // Late signals from the discarded job.
    old_job.emit_progress(JobProgress::indeterminate(80));
    old_job.complete(JobOutcome::succeeded(JobKind::Search).with_updates(agent.catalog()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(service.get_wu_status().state, WuState::Ready);
    assert!(service.get_available_updates().is_empty());
    assert_eq!(observer.count("progress_changed"), 0);
    assert_eq!(observer.count("async_operation_completed"), 0);

    // The new instance still reports normally.
    service.begin_search_updates().await.unwrap();
    agent
        .last_job()
        .unwrap()
        .emit_progress(JobProgress::indeterminate(30));
    complete_search(&agent, &service).await;
    observer.wait_for("async_operation_completed", 1).await;
    assert_eq!(observer.count("progress_changed"), 1);
}

#[tokio::test]
async fn test_reset_keeps_settings() {
    let (_agent, service) = service();
    service.set_auto_accept_eulas(true);
    service.set_auto_select_updates(true);
    service.set_search_timeout(42).unwrap();

    service.reset_service().await.unwrap();

    let settings = service.get_settings();
    assert!(settings.auto_accept_eulas);
    assert!(settings.auto_select_updates);
    assert_eq!(settings.search_timeout_secs, 42);
}

#[tokio::test]
async fn test_broken_observer_does_not_block_others() {
    let (_agent, service) = service();
    let healthy: Vec<_> = (0..3).map(|_| Recorder::new()).collect();

    service.register_for_callback(Arc::new(Broken));
    for observer in &healthy {
        service.register_for_callback(observer.clone());
    }

    service.begin_search_updates().await.unwrap();
    for observer in &healthy {
        observer.wait_for("state_changed", 1).await;
    }
    assert_eq!(service.observer_count(), 4);
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_set_timeouts() {
    let (_agent, service) = service();

    service.set_search_timeout(5).unwrap();
    service.set_download_timeout(10).unwrap();
    service.set_install_timeout(15).unwrap();

    let settings = service.get_settings();
    assert_eq!(
        (
            settings.search_timeout_secs,
            settings.download_timeout_secs,
            settings.install_timeout_secs
        ),
        (5, 10, 15)
    );
}

#[tokio::test]
async fn test_search_lists_found_updates_unselected() {
    let (agent, service) = service();

    assert_eq!(service.begin_search_updates().await.unwrap(), WuState::Searching);
    complete_search(&agent, &service).await;

    let updates = service.get_available_updates();
    assert_eq!(updates.len(), 3);
    assert!(updates.iter().all(|u| !u.is_selected));
}

#[tokio::test]
async fn test_download_without_selection_fails_precondition() {
    let (agent, service) = service();
    service.begin_search_updates().await.unwrap();
    complete_search(&agent, &service).await;

    let err = service.begin_download_updates().await.unwrap_err();
    assert!(matches!(err, ServiceError::PreconditionNotFulfilled { .. }));
    assert_eq!(service.get_wu_status().state, WuState::SearchCompleted);
}

#[tokio::test]
async fn test_out_of_range_timeouts_rejected() {
    let (_agent, service) = service();
    let before = service.get_settings().search_timeout_secs;

    for secs in [0, (MAX_TIMEOUT_SECS + 1) as i32] {
        let err = service.set_search_timeout(secs).unwrap_err();
        assert!(matches!(err, ServiceError::BadArgument { .. }), "{secs}");
    }
    assert_eq!(service.get_settings().search_timeout_secs, before);
}

#[tokio::test]
async fn test_shutdown_signal_reaches_observer_once() {
    let (_agent, service) = service();
    let observer = Recorder::new();
    assert!(service.register_for_callback(observer.clone()));
    assert!(!service.register_for_callback(observer.clone()));

    assert_eq!(service.send_shutdown_signal(), 1);
    observer.wait_for("service_shutdown", 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(observer.count("service_shutdown"), 1);

    assert_eq!(service.shutdown().await, WuState::Disposed);
    assert_eq!(service.observer_count(), 0);
}

#[tokio::test]
async fn test_shutdown_delivers_disposed_state() {
    let (_agent, service) = service();
    let observer = Recorder::new();
    service.register_for_callback(observer.clone());

    assert_eq!(service.shutdown().await, WuState::Disposed);
    observer.wait_for("state_changed", 1).await;

    let last = observer.events.lock().unwrap().last().cloned();
    assert!(
        matches!(last, Some(CallbackEvent::StateChanged { ref state, .. }) if *state == WuState::Disposed),
        "{last:?}"
    );
    assert!(!service.register_for_callback(Recorder::new()));
}

// ============================================================================
// End to end with the simulated agent
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_auto_agent_full_pipeline() {
    let agent = Arc::new(MockAgent::new(
        MockMode::Auto {
            step_delay: Duration::from_millis(100),
            steps: 4,
        },
        vec![
            AgentUpdate::new("KB1", "security").important().with_pending_eula(),
            AgentUpdate::new("KB2", "optional"),
        ],
    ));
    agent.set_install_requires_reboot(true);
    let mut settings = Settings::default();
    settings.auto_accept_eulas = true;
    settings.auto_select_updates = true;
    let service = WuRemoteService::new(
        agent.clone(),
        ServiceOptions {
            settings,
            ..ServiceOptions::default()
        },
    );
    let observer = Recorder::new();
    service.register_for_callback(observer.clone());

    service.begin_search_updates().await.unwrap();
    wait_for_state(&service, &WuState::SearchCompleted).await;
    let selected: Vec<_> = service
        .get_available_updates()
        .into_iter()
        .filter(|u| u.is_selected)
        .map(|u| u.id)
        .collect();
    assert_eq!(selected, vec!["KB1".to_string()]);

    service.begin_download_updates().await.unwrap();
    wait_for_state(&service, &WuState::DownloadCompleted).await;

    service.begin_install_updates().await.unwrap();
    wait_for_state(&service, &WuState::RebootRequired).await;
    assert!(service.get_available_updates()[0].is_installed);

    observer.wait_for("async_operation_completed", 3).await;
    assert!(observer.count("progress_changed") >= 3);

    service.reboot_host().await.unwrap();
    assert_eq!(agent.reboot_requests(), 1);
}

#[tokio::test]
async fn test_host_identity() {
    let agent = Arc::new(MockAgent::manual(Vec::new()));
    let service = WuRemoteService::new(
        agent,
        ServiceOptions {
            fqdn: Some("host.example.org".into()),
            ..ServiceOptions::default()
        },
    );
    assert_eq!(service.get_fqdn(), "host.example.org");
    assert!(!service.get_service_version().is_empty());
}
