//! Shared test utilities for integration tests
//!
//! `RunFixture` drives a full orchestrator run against `FakeControlPlane`
//! with a real callback listener on localhost.

#![allow(dead_code)]

use callcentre::config::RunParameters;
use callcentre::orchestrator::{
    BootTemplate, ChannelReporter, Orchestrator, RunEvent, RunNames, RunSummary,
};
use callcentre::testing::FakeControlPlane;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long any single wait may take before the test fails
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Boot config used by every integration test
pub const PHONE_HOME_TEMPLATE: &str = "#cloud-config\nruncmd:\n  - curl -X POST -d '{\"machine_id\": {{ machine_index }}}' http://{{ callback_host }}:{{ callback_port }}/phone\n";

/// Parameters for a localhost run of `count` instances
pub fn test_params(count: usize) -> RunParameters {
    let mut params = RunParameters::new(count, 1, 512, "127.0.0.1");
    params.listen_addr = "127.0.0.1:0".parse().unwrap();
    params.progress_interval = Duration::from_secs(60);
    params
}

pub fn boot_template() -> BootTemplate {
    BootTemplate::parse(PHONE_HOME_TEMPLATE).unwrap()
}

/// A run in progress, driven from the test body
pub struct RunFixture {
    pub fake: FakeControlPlane,
    pub cancel: CancellationToken,
    /// Every event received so far, in order
    pub seen: Vec<RunEvent>,
    pub callback_url: String,
    events: mpsc::Receiver<RunEvent>,
    task: JoinHandle<anyhow::Result<RunSummary>>,
    http: reqwest::Client,
}

impl RunFixture {
    /// Start a run and wait until its callback listener is up
    pub async fn start(fake: FakeControlPlane, params: RunParameters) -> Self {
        let (tx, events) = mpsc::channel(1024);
        let cancel = CancellationToken::new();
        let orchestrator = Orchestrator::new(fake.clone(), params, ChannelReporter::new(tx));

        let run_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            orchestrator
                .run_with(RunNames::generate(), boot_template(), run_cancel)
                .await
        });

        let mut fixture = Self {
            fake,
            cancel,
            seen: Vec::new(),
            callback_url: String::new(),
            events,
            task,
            http: reqwest::Client::new(),
        };
        let addr = match fixture
            .wait_for(|e| matches!(e, RunEvent::Listening { .. }))
            .await
        {
            RunEvent::Listening { addr } => addr,
            _ => unreachable!(),
        };
        fixture.callback_url = format!("http://{addr}/phone");
        fixture
    }

    /// Wait for the next event matching `pred`, recording everything seen
    pub async fn wait_for(&mut self, pred: impl Fn(&RunEvent) -> bool) -> RunEvent {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .expect("timed out waiting for run event")
                .expect("event channel closed");
            self.seen.push(event.clone());
            if pred(&event) {
                return event;
            }
        }
    }

    /// Wait until `n` instances have been launched
    pub async fn wait_launched(&mut self, n: usize) {
        let mut launched = self.count(|e| matches!(e, RunEvent::InstanceLaunched { .. }));
        while launched < n {
            self.wait_for(|e| matches!(e, RunEvent::InstanceLaunched { .. }))
                .await;
            launched += 1;
        }
    }

    /// Phone home as instance `index`
    pub async fn phone(&self, index: usize) {
        self.post_raw(format!("{{\"machine_id\": {index}}}")).await;
    }

    /// Post an arbitrary body to the callback endpoint
    pub async fn post_raw(&self, body: impl Into<String>) {
        let response = self
            .http
            .post(&self.callback_url)
            .header("content-type", "application/json")
            .body(body.into())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
    }

    pub fn count(&self, pred: impl Fn(&RunEvent) -> bool) -> usize {
        self.seen.iter().filter(|e| pred(e)).count()
    }

    /// Wait for the run to end and collect the remaining events
    pub async fn finish(mut self) -> (RunSummary, Vec<RunEvent>) {
        let summary = tokio::time::timeout(WAIT_TIMEOUT, &mut self.task)
            .await
            .expect("run did not finish in time")
            .expect("run task panicked")
            .expect("run failed");
        while let Ok(event) = self.events.try_recv() {
            self.seen.push(event);
        }
        (summary, self.seen)
    }
}
