// tests/ingest_scheduler.rs
use std::sync::Arc;
use std::time::Duration;

use article_triage::classify::TaxonomyRules;
use article_triage::config::PipelineConfig;
use article_triage::ingest::config::SourcePriority;
use article_triage::ingest::scheduler::{run_tick, spawn_batch_scheduler, BatchSchedulerCfg, SpoolCollector};
use article_triage::ingest::{DocumentCollector, RawDocument};
use article_triage::judge::{HashingEmbedder, MockJudge, ServiceGate};
use article_triage::pipeline::{Pipeline, Services};
use article_triage::prefilter::{PrefilterEngine, PrefilterHandle};
use article_triage::store::Store;
use async_trait::async_trait;

fn pipeline(store: Arc<Store>) -> Pipeline {
    let mut cfg = PipelineConfig::default();
    cfg.store.data_dir = None;
    let services = Services {
        rules: Arc::new(TaxonomyRules::builtin().unwrap()),
        prefilter: PrefilterHandle::new(PrefilterEngine::builtin().unwrap()),
        embedder: Arc::new(HashingEmbedder::default()),
        judge: Arc::new(MockJudge::new()),
        gate: ServiceGate::new(4, Duration::from_secs(2)),
        priority: SourcePriority::default(),
    };
    Pipeline::new(cfg, store, services)
}

const SUBJECTS: [&str; 8] = [
    "criminal history checks for nurses",
    "drug testing of warehouse staff",
    "right to work checks for seasonal farm workers",
    "credit history reviews of bank job applicants",
    "fingerprint vetting for school volunteers",
    "driving record screening of delivery couriers",
    "identity verification for remote contractors",
    "conviction disclosure by taxi license holders",
];

fn doc(n: usize) -> RawDocument {
    let subject = SUBJECTS[n % SUBJECTS.len()];
    RawDocument {
        title: Some(format!("Regulator publishes background check guidance on {subject}")),
        body: Some(format!(
            "Employers must follow new background screening rules on {subject}, according to the published guidance."
        )),
        url: Some(format!("https://news.test/{n}")),
        source: Some("Wire".into()),
        ..RawDocument::default()
    }
}

struct Broken;

#[async_trait]
impl DocumentCollector for Broken {
    async fn fetch_batch(&self) -> anyhow::Result<Vec<RawDocument>> {
        anyhow::bail!("upstream down")
    }
    fn name(&self) -> &'static str {
        "broken"
    }
}

#[tokio::test]
async fn tick_processes_spool_and_survives_failing_collectors() {
    let spool = tempfile::tempdir().unwrap();
    std::fs::write(
        spool.path().join("batch-1.json"),
        serde_json::to_string(&vec![doc(1), doc(2)]).unwrap(),
    )
    .unwrap();

    let store = Arc::new(Store::in_memory(180));
    let p = pipeline(store.clone());
    let collectors: Vec<Box<dyn DocumentCollector>> = vec![Box::new(Broken), Box::new(SpoolCollector::new(spool.path()))];

    assert_eq!(run_tick(&p, &collectors).await, 2);
    assert_eq!(store.len(), 2);

    // consumed files are not re-read
    assert_eq!(run_tick(&p, &collectors).await, 0);
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn scheduler_ticks_on_its_interval() {
    let spool = tempfile::tempdir().unwrap();
    std::fs::write(spool.path().join("a.json"), serde_json::to_string(&vec![doc(7)]).unwrap()).unwrap();

    let store = Arc::new(Store::in_memory(180));
    let p = Arc::new(pipeline(store.clone()));
    let handle = spawn_batch_scheduler(
        BatchSchedulerCfg {
            interval: Duration::from_millis(20),
        },
        p,
        vec![Box::new(SpoolCollector::new(spool.path()))],
    );

    let mut waited = 0;
    while store.is_empty() && waited < 100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += 1;
    }
    handle.abort();
    assert_eq!(store.len(), 1);
}
