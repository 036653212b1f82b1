// tests/agent_ask.rs
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use article_triage::agent::{AskFilters, AskStatus, QueryAgent};
use article_triage::classify::TaxonomyRules;
use article_triage::config::AgentConfig;
use article_triage::error::ServiceError;
use article_triage::judge::{HashingEmbedder, MockJudge, ServiceGate};
use article_triage::model::{Article, Classification, Region, RelevanceAssessment, Tier, Topic};
use article_triage::store::Store;
use chrono::{Duration as ChronoDuration, Utc};

fn put(store: &Store, id: &str, title: &str, region: Region, topics: &[Topic], days_ago: i64) {
    let a = Article {
        id: id.into(),
        title: title.into(),
        body: format!("{title}. Further details in the full report."),
        url: format!("https://news.test/{id}"),
        source: "Wire".into(),
        published_at: Utc::now() - ChronoDuration::days(days_ago),
        language: "en".into(),
        summary: title.into(),
    };
    let c = Classification::new(region, topics.iter().copied().collect(), 0.8, "seeded").unwrap();
    let r = RelevanceAssessment {
        lexical_score: 0.7,
        semantic_score: 0.6,
        model_score: Some(0.8),
        composite_score: 0.72,
        tier: Tier::Shortlist,
    };
    let v = HashingEmbedder::default().embed_one(&a.embedding_text());
    store.put(a, c, r, Some(v)).unwrap();
}

/// Three APAC regulatory stories among ten distractors.
fn corpus() -> Arc<Store> {
    let store = Arc::new(Store::in_memory(180));
    put(&store, "apac-sg", "Singapore regulator updates employment screening guidance", Region::Apac, &[Topic::Regulatory], 3);
    put(&store, "apac-au", "Australia passes law limiting criminal record checks", Region::Apac, &[Topic::Legislation, Topic::CriminalRecords], 5);
    put(&store, "apac-jp", "Japan watchdog fines agency over background check data", Region::Apac, &[Topic::Enforcement, Topic::DataPrivacy], 8);

    put(&store, "eu-1", "EU regulator issues GDPR vetting guidance", Region::Europe, &[Topic::Regulatory], 2);
    put(&store, "eu-2", "German court limits pre-employment checks", Region::Europe, &[Topic::Litigation], 4);
    put(&store, "uk-1", "Home Office updates right to work rules", Region::Uk, &[Topic::Regulatory, Topic::RightToWork], 6);
    put(&store, "na-1", "California expands fair chance hiring law", Region::NorthAmerica, &[Topic::Legislation], 1);
    put(&store, "na-2", "CFPB enforcement action against screening firm", Region::NorthAmerica, &[Topic::Enforcement], 9);
    put(&store, "apac-biz-1", "Asia screening provider raises funding", Region::Apac, &[Topic::IndustryNews], 2);
    put(&store, "apac-biz-2", "India background check firm opens new office", Region::Apac, &[Topic::IndustryNews], 3);
    put(&store, "apac-lit", "Hong Kong court hears employee vetting appeal", Region::Apac, &[Topic::Litigation], 7);
    put(&store, "mea-1", "UAE tightens employment visa checks", Region::MiddleEastAfrica, &[Topic::Regulatory], 4);
    put(&store, "latam-1", "Brazil LGPD guidance on candidate data", Region::LatinAmerica, &[Topic::DataPrivacy], 5);
    store
}

fn agent(store: Arc<Store>, judge: MockJudge) -> QueryAgent {
    QueryAgent::new(
        store,
        Arc::new(TaxonomyRules::builtin().unwrap()),
        Arc::new(HashingEmbedder::default()),
        Arc::new(judge),
        ServiceGate::new(4, Duration::from_secs(5)),
        AgentConfig::default(),
    )
}

#[tokio::test]
async fn apac_regulation_question_cites_only_apac_regulatory_articles() {
    let a = agent(corpus(), MockJudge::new());
    let r = a.ask("recent APAC regulation changes", None).await;

    assert_eq!(r.status, AskStatus::Answered);
    let cited: BTreeSet<&str> = r.cited_article_ids.iter().map(String::as_str).collect();
    let expected: BTreeSet<&str> = ["apac-sg", "apac-au", "apac-jp"].into_iter().collect();
    assert_eq!(cited, expected);
    assert!(r.confidence > 0.0 && r.confidence <= 1.0);
    assert!(r.answer.contains("apac-sg"));
}

#[tokio::test]
async fn citations_always_resolve_to_stored_articles() {
    let store = corpus();
    let judge = MockJudge::scripted([r#"{"answer":"See the report.","cited":["ghost-1","apac-au"],"confidence":0.9}"#]);
    let a = agent(store.clone(), judge);
    let r = a.ask("recent APAC regulation changes", None).await;

    assert_eq!(r.cited_article_ids, vec!["apac-au".to_string()]);
    for id in &r.cited_article_ids {
        assert!(store.get(id).is_some(), "cited id {id} not in store");
    }
}

#[tokio::test]
async fn uncitable_model_answer_falls_back_to_extractive() {
    let judge = MockJudge::scripted([r#"{"answer":"Trust me.","cited":["ghost-1"]}"#]);
    let a = agent(corpus(), judge);
    let r = a.ask("recent APAC regulation changes", None).await;

    assert_eq!(r.status, AskStatus::Answered);
    assert_eq!(r.cited_article_ids.len(), 3);
    assert!(!r.cited_article_ids.iter().any(|id| id == "ghost-1"));
    assert!(r.answer.starts_with("3 relevant article(s)"));
}

#[tokio::test]
async fn no_matching_articles_is_reported_not_invented() {
    let a = agent(corpus(), MockJudge::new());
    let filters = AskFilters {
        region: Some(Region::Apac),
        topics: Some(vec![Topic::DrugTesting]),
        date_range: None,
    };
    let r = a.ask("drug testing news", Some(&filters)).await;

    assert_eq!(r.status, AskStatus::InsufficientEvidence);
    assert!(r.cited_article_ids.is_empty());
    assert_eq!(r.confidence, 0.0);
}

#[tokio::test]
async fn explicit_region_filter_overrides_the_question() {
    let a = agent(corpus(), MockJudge::new());
    let filters = AskFilters {
        region: Some(Region::Europe),
        ..AskFilters::default()
    };
    let r = a.ask("recent APAC regulation changes", Some(&filters)).await;

    assert_eq!(r.status, AskStatus::Answered);
    assert_eq!(r.cited_article_ids, vec!["eu-1".to_string()]);
}

#[tokio::test]
async fn unavailable_model_still_answers_from_retrieval() {
    let a = agent(corpus(), MockJudge::failing());
    let r = a.ask("recent APAC regulation changes", None).await;

    assert_eq!(r.status, AskStatus::Answered);
    assert_eq!(r.cited_article_ids.len(), 3);
}

#[tokio::test]
async fn busy_gate_cannot_stretch_the_answer_deadline() {
    let gate = ServiceGate::new(1, Duration::from_secs(5));
    let holder = gate.clone();
    let held = tokio::spawn(async move {
        holder
            .run("judge", async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok::<_, ServiceError>(())
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let a = QueryAgent::new(
        corpus(),
        Arc::new(TaxonomyRules::builtin().unwrap()),
        Arc::new(HashingEmbedder::default()),
        Arc::new(MockJudge::new()),
        gate,
        AgentConfig {
            simple_deadline_ms: 100,
            complex_deadline_ms: 100,
            ..AgentConfig::default()
        },
    );
    let started = Instant::now();
    let r = a.ask("recent APAC regulation changes", None).await;

    assert!(started.elapsed() < Duration::from_millis(500), "took {:?}", started.elapsed());
    assert_eq!(r.status, AskStatus::Partial);
    held.abort();
}
