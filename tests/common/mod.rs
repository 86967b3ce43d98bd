//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use landscout::core::{CascadeRequest, JobStore, Orchestrator, OrchestratorSettings};
use landscout::domain::{
    BuilderData, CommunityData, Job, ProposedChange, ProposedData, SalesRepData,
};
use landscout::{Collector, CollectorError, CollectorOutput};

/// What the scripted collector does for a given search query
#[derive(Clone)]
pub enum Script {
    Output(CollectorOutput),
    Fail(String),
    Panic(&'static str),
    /// Wait for the gate, then return the output
    Gated(Arc<Notify>, CollectorOutput),
}

/// Collector answering from a table keyed by search query
#[derive(Default)]
pub struct ScriptedCollector {
    scripts: Mutex<HashMap<String, Script>>,
    seen: Mutex<Vec<Job>>,
}

impl ScriptedCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, query: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(query.to_string(), script);
    }

    /// Jobs handed to the collector so far
    pub fn seen(&self) -> Vec<Job> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Collector for ScriptedCollector {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(&self, job: &Job) -> Result<CollectorOutput, CollectorError> {
        self.seen.lock().unwrap().push(job.clone());

        let script = job
            .search_query
            .as_deref()
            .and_then(|q| self.scripts.lock().unwrap().get(q).cloned());

        match script {
            None => Ok(CollectorOutput::default()),
            Some(Script::Output(output)) => Ok(output),
            Some(Script::Fail(message)) => Err(CollectorError::Unrecoverable(message)),
            Some(Script::Panic(message)) => panic!("{}", message),
            Some(Script::Gated(gate, output)) => {
                gate.notified().await;
                Ok(output)
            }
        }
    }
}

pub fn orchestrator(collector: Arc<ScriptedCollector>) -> Orchestrator {
    let store = JobStore::open_in_memory().unwrap();
    Orchestrator::new(store, collector, OrchestratorSettings::default())
}

pub fn community(name: &str, confidence: f64) -> ProposedChange {
    ProposedChange::new(
        ProposedData::Community(CommunityData {
            name: name.to_string(),
            city: Some("Austin".to_string()),
            state: Some("TX".to_string()),
            website: None,
        }),
        confidence,
    )
}

pub fn builder(name: &str, confidence: f64) -> ProposedChange {
    ProposedChange::new(
        ProposedData::Builder(BuilderData {
            name: name.to_string(),
            website: None,
            phone: None,
        }),
        confidence,
    )
}

pub fn sales_rep(name: &str, confidence: f64) -> ProposedChange {
    ProposedChange::new(
        ProposedData::SalesRep(SalesRepData {
            name: name.to_string(),
            email: Some(format!("{}@example.com", name.to_lowercase().replace(' ', "."))),
            phone: None,
        }),
        confidence,
    )
}

pub fn cascade_builder(name: &str) -> CascadeRequest {
    CascadeRequest::new(landscout::EntityType::Builder, name).at("Austin TX")
}

/// Start the next job and wait for its execution to finish
pub async fn run_next(orch: &Orchestrator) -> Option<uuid::Uuid> {
    let (outcome, handle) = orch.start_next_tracked().unwrap();
    if let Some(handle) = handle {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("job execution timed out")
            .expect("job execution task failed");
    }
    outcome.job_id
}
