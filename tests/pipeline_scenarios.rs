// tests/pipeline_scenarios.rs
use std::sync::Arc;
use std::time::Duration;

use article_triage::classify::TaxonomyRules;
use article_triage::config::PipelineConfig;
use article_triage::ingest::config::SourcePriority;
use article_triage::ingest::{normalize, RawDocument};
use article_triage::judge::{HashingEmbedder, MockJudge, ServiceGate};
use article_triage::model::{Region, Tier, Topic};
use article_triage::pipeline::{CancelFlag, Pipeline, Services};
use article_triage::prefilter::{PrefilterEngine, PrefilterHandle};
use article_triage::store::Store;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

const BTB_TITLE: &str = "State expands ban the box law for employers";
const BTB_BODY: &str = "New legislation restricts when employers may ask about criminal history and \
     conviction records during hiring and background checks.";

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 12, 12, 0, 0).unwrap()
}

fn pipeline(store: Arc<Store>) -> Pipeline {
    let mut cfg = PipelineConfig::default();
    cfg.store.data_dir = None;
    cfg.scoring.reputation_prior_weight = 0.0;
    let services = Services {
        rules: Arc::new(TaxonomyRules::builtin().unwrap()),
        prefilter: PrefilterHandle::new(PrefilterEngine::builtin().unwrap()),
        embedder: Arc::new(HashingEmbedder::default()),
        judge: Arc::new(MockJudge::new()),
        gate: ServiceGate::new(4, Duration::from_secs(2)),
        priority: SourcePriority::new(vec!["Reuters".into(), "Local Wire".into()]),
    };
    Pipeline::new(cfg, store, services)
}

fn raw(title: &str, body: &str, source: &str, hours_ago: i64) -> RawDocument {
    RawDocument {
        title: Some(title.into()),
        body: Some(body.into()),
        url: Some(format!("https://{}.test/story", source.to_lowercase().replace(' ', "-"))),
        source: Some(source.into()),
        published_at: Some(now() - ChronoDuration::hours(hours_ago)),
        language: Some("en".into()),
    }
}

fn id_of(doc: &RawDocument) -> String {
    normalize(doc, now()).unwrap().id
}

const CA_TITLE: &str = "California expands Ban the Box to employers with 5+ staff";
const CA_BODY: &str = "California lawmakers approved an expansion of the state's Ban the Box law on Monday. \
     Employers with five or more staff may no longer ask job applicants about criminal history or \
     conviction records before making a conditional offer of employment. The Civil Rights Department \
     will enforce the rule starting next year.";
const CA_REWORDED_TITLE: &str = "Ban the Box expanded to California employers with five or more staff";
const CA_REWORDED_BODY: &str = "On Monday, California lawmakers voted to expand the state's Ban the Box law. \
     Job applicants can no longer be asked about conviction records or criminal history by employers with \
     five or more staff until a conditional offer of employment is made. Enforcement by the Civil Rights \
     Department starts next year.";

#[tokio::test]
async fn ban_the_box_story_is_shortlisted_once() {
    let store = Arc::new(Store::in_memory(180));
    let p = pipeline(store.clone());

    let a = raw(CA_TITLE, CA_BODY, "Reuters", 30);
    let sports = raw(
        "League announces new schedule",
        "The football league announced a new schedule for the season, with the opening match on Saturday.",
        "Sports Daily",
        30,
    );
    let first = p.run_batch_at(&[a.clone(), sports.clone()], &CancelFlag::new(), now()).await.unwrap();
    assert_eq!(first.received, 2);
    assert_eq!(first.rejected, 1);
    assert_eq!(first.scored, 1);
    assert_eq!(first.tiers.shortlist, 1);
    assert_eq!(first.shortlist.len(), 1);

    let stored_a = store.get(&id_of(&a)).unwrap();
    let c = stored_a.classification().unwrap();
    assert_eq!(c.region, Region::NorthAmerica);
    assert!(c.has_regulatory_topic(), "{c:?}");
    assert!(c.topics.contains(&Topic::CriminalRecords));
    assert_eq!(stored_a.tier(), Some(Tier::Shortlist));

    // rejected article is kept for audit but never surfaces
    let rejected = store.get(&id_of(&sports)).unwrap();
    assert!(rejected.rejection.is_some());
    assert_eq!(store.rejected().len(), 1);

    // a second outlet rewrites the same story a day later
    let b = raw(CA_REWORDED_TITLE, CA_REWORDED_BODY, "Local Wire", 6);
    let second = p.run_batch_at(&[b.clone()], &CancelFlag::new(), now()).await.unwrap();
    assert_eq!(second.duplicates, 1);
    assert_eq!(second.scored, 0);

    let stored_b = store.get(&id_of(&b)).unwrap();
    assert_eq!(stored_b.duplicate_of.as_deref(), Some(id_of(&a).as_str()));
    let cluster = store.cluster_of(&id_of(&a)).unwrap();
    assert!(cluster.member_ids.contains(&id_of(&b)));
    assert!(cluster.similarity_scores[&id_of(&b)] >= 0.85);

    let shortlist = store.shortlist(now() - ChronoDuration::days(2), now());
    assert_eq!(shortlist.len(), 1);
    assert_eq!(shortlist[0].article_id, id_of(&a));
}

#[tokio::test]
async fn earlier_report_arriving_late_takes_over_the_cluster() {
    let store = Arc::new(Store::in_memory(180));
    let p = pipeline(store.clone());

    let later = raw(BTB_TITLE, BTB_BODY, "Local Wire", 2);
    p.run_batch_at(&[later.clone()], &CancelFlag::new(), now()).await.unwrap();

    let earlier = raw("State expands ban the box law for all employers", BTB_BODY, "Reuters", 6);
    let r = p.run_batch_at(&[earlier.clone()], &CancelFlag::new(), now()).await.unwrap();
    assert_eq!(r.duplicates, 0);
    assert_eq!(r.scored, 1);

    let demoted = store.get(&id_of(&later)).unwrap();
    assert_eq!(demoted.duplicate_of.as_deref(), Some(id_of(&earlier).as_str()));
    let cluster = store.cluster_of(&id_of(&earlier)).unwrap();
    assert!(cluster.member_ids.contains(&id_of(&later)));

    let day = store.shortlist(now() - ChronoDuration::days(1), now());
    assert!(day.iter().all(|e| e.article_id != id_of(&later)));
}

#[tokio::test]
async fn one_bad_record_does_not_sink_the_batch() {
    let store = Arc::new(Store::in_memory(180));
    let p = pipeline(store.clone());

    let mut no_url = raw("Regulator updates screening guidance", BTB_BODY, "Reuters", 1);
    no_url.url = None;
    let mut empty_body = raw("Another story", "", "Reuters", 1);
    empty_body.body = Some("   ".into());
    let good = raw(BTB_TITLE, BTB_BODY, "Reuters", 1);

    let r = p
        .run_batch_at(&[no_url, good.clone(), empty_body], &CancelFlag::new(), now())
        .await
        .unwrap();
    assert_eq!(r.malformed.len(), 2);
    assert_eq!(r.malformed[0].field, "url");
    assert_eq!(r.malformed[1].field, "body");
    assert_eq!(r.scored, 1);
    assert!(store.contains(&id_of(&good)));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn every_stored_classification_is_valid() {
    let store = Arc::new(Store::in_memory(180));
    let p = pipeline(store.clone());
    let docs = vec![
        raw("FCRA lawsuit filed against screening firm", "A class action lawsuit claims the consumer reporting agency violated the Fair Credit Reporting Act.", "Reuters", 1),
        raw("UK updates DBS check rules", "The Home Office published new guidance on DBS checks for employers in England and Wales.", "Reuters", 2),
        raw("Singapore PDPA guidance on employee vetting", "The PDPC issued guidance for employers on background screening and personal data.", "Reuters", 3),
        raw("Screening industry consolidates", "Two background check providers announced a merger to expand international screening services.", "Reuters", 4),
    ];
    let r = p.run_batch_at(&docs, &CancelFlag::new(), now()).await.unwrap();
    assert_eq!(r.scored, 4);
    for d in &docs {
        let s = store.get(&id_of(d)).unwrap();
        let c = s.classification().unwrap();
        assert!(c.is_valid(), "{c:?}");
        assert!(!c.topics.is_empty());
        let a = s.assessment.unwrap();
        assert!((0.0..=1.0).contains(&a.composite_score));
    }
}
