// tests/optimize_loop.rs
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use article_triage::classify::TaxonomyRules;
use article_triage::config::{OptimizeConfig, PipelineConfig};
use article_triage::error::ServiceError;
use article_triage::ingest::config::SourcePriority;
use article_triage::ingest::RawDocument;
use article_triage::judge::embed::DynEmbedder;
use article_triage::judge::{Embedder, HashingEmbedder, MockJudge, ServiceGate};
use article_triage::model::{Article, Classification, Region, RelevanceAssessment, SignalSnapshot, Tier, Topic, TrainingExample};
use article_triage::optimize::{label, CompiledParams, LiveParams, OptimizationLoop, OptimizeOutcome};
use article_triage::prefilter::{PrefilterEngine, PrefilterHandle};
use article_triage::store::Store;
use article_triage::{CancelFlag, Pipeline, Services};
use async_trait::async_trait;
use chrono::Utc;

/// Counts how many texts reach the embedding service.
#[derive(Default)]
struct CountingEmbedder {
    texts: AtomicUsize,
    inner: HashingEmbedder,
}

#[async_trait]
impl Embedder for CountingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        self.inner.embed(texts).await
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

fn article(id: &str, title: &str) -> Article {
    Article {
        id: id.into(),
        title: title.into(),
        body: title.into(),
        url: format!("https://news.test/{id}"),
        source: "Wire".into(),
        published_at: Utc::now(),
        language: "en".into(),
        summary: title.into(),
    }
}

fn example(id: &str, relevance: Tier, sig: (f32, f32, f32)) -> TrainingExample {
    TrainingExample {
        article: article(id, "Screening industry update"),
        classification: Classification::new(Region::Global, [Topic::IndustryNews].into_iter().collect(), 1.0, "label").unwrap(),
        relevance,
        signals: Some(SignalSnapshot {
            lexical: sig.0,
            semantic: sig.1,
            model: Some(sig.2),
            source_acceptance: None,
        }),
        labeled_at: Utc::now(),
    }
}

/// Relevant stories score high on cheap signals; the model over-rates the rest.
fn skewed(prefix: &str, n: usize) -> Vec<TrainingExample> {
    (0..n)
        .flat_map(|i| {
            [
                example(&format!("{prefix}-pos-{i}"), Tier::Shortlist, (0.9, 0.9, 0.3)),
                example(&format!("{prefix}-neg-{i}"), Tier::Discard, (0.4, 0.4, 1.0)),
            ]
        })
        .collect()
}

fn optimize_cfg(dir: &std::path::Path) -> OptimizeConfig {
    OptimizeConfig {
        batch_size: 10,
        validation_ratio: 0.5,
        log_path: dir.join("training.jsonl"),
        pointer_path: dir.join("deployed.json"),
        ..OptimizeConfig::default()
    }
}

fn optimizer_with(dir: &std::path::Path, embedder: DynEmbedder, live: LiveParams) -> OptimizationLoop {
    OptimizationLoop::new(
        optimize_cfg(dir),
        Arc::new(TaxonomyRules::builtin().unwrap()),
        embedder,
        ServiceGate::new(2, Duration::from_secs(5)),
        live,
    )
}

fn optimizer(dir: &std::path::Path) -> OptimizationLoop {
    optimizer_with(
        dir,
        Arc::new(HashingEmbedder::default()),
        LiveParams::new(CompiledParams::from_config(&PipelineConfig::default())),
    )
}

#[test]
fn waits_for_a_full_batch_of_labels() {
    let dir = tempfile::tempdir().unwrap();
    let opt = optimizer(dir.path());
    opt.record(&skewed("a", 2)).unwrap();
    assert_eq!(
        opt.run_once().unwrap(),
        OptimizeOutcome::Waiting { pending: 4, needed: 10 }
    );
    assert!(opt.deployed().unwrap().is_none());
}

#[test]
fn better_version_is_promoted_and_equal_one_is_not() {
    let dir = tempfile::tempdir().unwrap();
    let opt = optimizer(dir.path());
    let base = opt.current_params().unwrap();

    opt.record(&skewed("a", 20)).unwrap();
    let outcome = opt.run_once().unwrap();
    let OptimizeOutcome::Promoted { version, validation_score, previous_score } = outcome else {
        panic!("expected promotion, got {outcome:?}");
    };
    assert_eq!(version, 1);
    assert!(validation_score > previous_score);
    let deployed = opt.deployed().unwrap().unwrap();
    assert_eq!(deployed.version, 1);
    assert_eq!(deployed.trained_on, 40);
    assert_ne!(opt.current_params().unwrap().scoring, base.scoring);

    // nothing new yet
    assert!(matches!(opt.run_once().unwrap(), OptimizeOutcome::Waiting { pending: 0, .. }));

    // more of the same cannot beat the tuned version
    opt.record(&skewed("b", 5)).unwrap();
    let outcome = opt.run_once().unwrap();
    assert!(
        matches!(outcome, OptimizeOutcome::Retained { version: 1, .. }),
        "{outcome:?}"
    );
    let deployed = opt.deployed().unwrap().unwrap();
    assert_eq!(deployed.version, 1);
    assert_eq!(deployed.trained_on, 50);
}

#[tokio::test]
async fn selection_skips_labeled_articles_and_ranks_uncertain_ones_first() {
    let dir = tempfile::tempdir().unwrap();
    let opt = optimizer(dir.path());
    let store = Store::in_memory(180);

    let put = |id: &str, confidence: f32, composite: f32, tier: Tier| {
        let c = Classification::new(Region::Europe, [Topic::Regulatory].into_iter().collect(), confidence, "model").unwrap();
        let r = RelevanceAssessment {
            lexical_score: 0.5,
            semantic_score: 0.5,
            model_score: Some(0.5),
            composite_score: composite,
            tier,
        };
        let a = article(id, &format!("EU guidance on vetting {id}"));
        let v = HashingEmbedder::default().embed_one(&a.embedding_text());
        store.put(a, c, r, Some(v)).unwrap();
    };
    put("borderline", 0.5, 0.6, Tier::ReviewQueue);
    put("confident-review", 0.95, 0.4, Tier::ReviewQueue);
    put("labeled", 0.3, 0.5, Tier::ReviewQueue);
    put("clear-shortlist", 0.95, 0.95, Tier::Shortlist);

    let stored = store.get("labeled").unwrap();
    let truth = Classification::new(Region::Europe, [Topic::Regulatory].into_iter().collect(), 1.0, "human").unwrap();
    opt.record(&[label(&stored, None, truth, Tier::Shortlist, Utc::now())]).unwrap();

    let picked = opt.select(&store).await.unwrap();
    let ids: Vec<&str> = picked.iter().map(|c| c.article_id.as_str()).collect();
    assert_eq!(ids, vec!["borderline", "confident-review"]);
    assert!(picked[0].uncertainty > picked[1].uncertainty);
}

#[test]
fn promotion_swaps_the_shared_params() {
    let dir = tempfile::tempdir().unwrap();
    let live = LiveParams::new(CompiledParams::from_config(&PipelineConfig::default()));
    let opt = optimizer_with(dir.path(), Arc::new(HashingEmbedder::default()), live.clone());
    let before = live.get();

    opt.record(&skewed("a", 20)).unwrap();
    assert!(matches!(opt.run_once().unwrap(), OptimizeOutcome::Promoted { version: 1, .. }));

    let deployed = opt.deployed().unwrap().unwrap();
    assert_eq!(live.get().scoring, deployed.params.scoring);
    assert_ne!(live.get().scoring, before.scoring);

    // a retained attempt leaves the live params alone
    opt.record(&skewed("b", 5)).unwrap();
    assert!(matches!(opt.run_once().unwrap(), OptimizeOutcome::Retained { .. }));
    assert_eq!(live.get().scoring, deployed.params.scoring);
}

#[tokio::test]
async fn labeled_set_is_embedded_once_across_selections() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = Arc::new(CountingEmbedder::default());
    let opt = optimizer_with(
        dir.path(),
        embedder.clone(),
        LiveParams::new(CompiledParams::from_config(&PipelineConfig::default())),
    );
    let store = Store::in_memory(180);
    opt.record(&skewed("a", 3)).unwrap();

    opt.select(&store).await.unwrap();
    assert_eq!(embedder.texts.load(Ordering::SeqCst), 6);
    assert_eq!(opt.cached_vectors(), 6);

    opt.select(&store).await.unwrap();
    assert_eq!(embedder.texts.load(Ordering::SeqCst), 6);

    // only the new label is embedded
    opt.record(&skewed("b", 1)[..1]).unwrap();
    opt.select(&store).await.unwrap();
    assert_eq!(embedder.texts.load(Ordering::SeqCst), 7);
    assert_eq!(opt.cached_vectors(), 7);
}

#[tokio::test]
async fn promoted_params_score_the_next_batch() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = PipelineConfig::default();
    cfg.store.data_dir = None;
    cfg.scoring.reputation_prior_weight = 0.0;
    let store = Arc::new(Store::in_memory(180));
    let services = Services {
        rules: Arc::new(TaxonomyRules::builtin().unwrap()),
        prefilter: PrefilterHandle::new(PrefilterEngine::builtin().unwrap()),
        embedder: Arc::new(HashingEmbedder::default()),
        judge: Arc::new(MockJudge::new()),
        gate: ServiceGate::new(4, Duration::from_secs(2)),
        priority: SourcePriority::default(),
    };
    let pipeline = Pipeline::new(cfg, store.clone(), services);
    let opt = optimizer_with(dir.path(), Arc::new(HashingEmbedder::default()), pipeline.live_params().clone());

    opt.record(&skewed("a", 20)).unwrap();
    assert!(matches!(opt.run_once().unwrap(), OptimizeOutcome::Promoted { .. }));
    let deployed = opt.deployed().unwrap().unwrap().params.scoring;

    let doc = RawDocument {
        title: Some("Regulator tightens FCRA background check rules".into()),
        body: Some("The CFPB issued new FCRA guidance on background checks used by employers in hiring.".into()),
        url: Some("https://news.test/fcra".into()),
        source: Some("Wire".into()),
        published_at: Some(Utc::now()),
        language: Some("en".into()),
    };
    let report = pipeline.run_batch(&[doc], &CancelFlag::new()).await.unwrap();
    assert_eq!(report.scored, 1);

    let (article, _) = store.dedup_seed(Utc::now() - chrono::Duration::days(1)).remove(0);
    let a = store.get(&article.id).unwrap().assessment.unwrap();
    let expected = deployed.composite(a.lexical_score, a.semantic_score, a.model_score);
    assert!((a.composite_score - expected).abs() < 1e-6);
    assert_eq!(a.tier, deployed.tier(a.composite_score));
}
