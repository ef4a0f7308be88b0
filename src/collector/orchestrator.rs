use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures_util::{StreamExt, stream};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::api::client::GameDataClient;
use crate::api::executor::FetchResult;
use crate::api::models::ClanSearch;
use crate::config::CollectionConfig;
use crate::metrics::METRICS;
use crate::schema::{
    CapitalRaidRecord, ClanSnapshot, CwlRound, PlayerSnapshot, WarAttack, WarRecord,
};
use crate::store::{Collection, DedupKey, Store};
use crate::util;

/// War tags of CWL rounds that have not been drawn yet.
const UNDRAWN_WAR_TAG: &str = "#0";

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    /// Pause between two tracked clans, on top of the token bucket
    pub entity_delay: Duration,
    /// Only the first N members are fetched
    pub member_limit: usize,
    /// Concurrent member fetches
    pub member_concurrency: usize,
    pub raid_season_limit: u32,
}

impl From<&CollectionConfig> for CollectorSettings {
    fn from(cfg: &CollectionConfig) -> Self {
        Self {
            entity_delay: cfg.entity_delay(),
            member_limit: cfg.member_limit,
            member_concurrency: cfg.member_concurrency.max(1),
            raid_season_limit: cfg.raid_season_limit,
        }
    }
}

/// Startup inputs merged into the stored tracked set.
#[derive(Debug, Clone, Default)]
pub struct Bootstrap {
    pub seeds: Vec<String>,
    pub discovery: Option<ClanSearch>,
}

/// Steps of one clan's pipeline, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FetchParent,
    FanOutChildren,
    FetchHistories,
    Persist,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::FetchParent => "fetch-parent",
            Stage::FanOutChildren => "fan-out",
            Stage::FetchHistories => "fetch-histories",
            Stage::Persist => "persist",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityOutcome {
    Succeeded,
    Partial,
    Failed,
}

/// What happened to one tracked clan during one cycle.
#[derive(Debug, Clone)]
pub struct EntityReport {
    pub tag: String,
    pub outcome: EntityOutcome,
    /// Stage where the pipeline short-circuited, if it did
    pub stopped_at: Option<Stage>,
    pub errors: Vec<String>,
    pub written: usize,
    pub skipped: usize,
}

impl EntityReport {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            outcome: EntityOutcome::Succeeded,
            stopped_at: None,
            errors: Vec::new(),
            written: 0,
            skipped: 0,
        }
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
        if self.outcome == EntityOutcome::Succeeded {
            self.outcome = EntityOutcome::Partial;
        }
    }

    fn short_circuit(&mut self, stage: Stage, msg: impl Into<String>) {
        self.stopped_at.get_or_insert(stage);
        self.error(msg);
    }

    fn fail(&mut self, stage: Stage, msg: impl Into<String>) {
        self.short_circuit(stage, msg);
        self.outcome = EntityOutcome::Failed;
    }
}

/// One pass over every tracked clan. Lives for the duration of the
/// cycle and is only logged, never stored.
#[derive(Debug, Clone)]
pub struct CycleRun {
    pub started_at: DateTime<Utc>,
    pub tracked: usize,
    pub reports: Vec<EntityReport>,
}

impl CycleRun {
    fn start(tracked: usize) -> Self {
        Self {
            started_at: util::now_utc(),
            tracked,
            reports: Vec::with_capacity(tracked),
        }
    }

    pub fn count(&self, outcome: EntityOutcome) -> usize {
        self.reports.iter().filter(|r| r.outcome == outcome).count()
    }

    pub fn failed_entities(&self) -> Vec<&str> {
        self.reports
            .iter()
            .filter(|r| r.outcome == EntityOutcome::Failed)
            .map(|r| r.tag.as_str())
            .collect()
    }

    /// Per-cycle line for operators; failed clans are listed by tag.
    pub fn summary_line(&self, elapsed: Duration) -> String {
        let mut line = format!(
            "collection cycle started {} completed in {:?}: {} tracked, {} ok, {} partial, {} failed",
            self.started_at.format("%Y-%m-%dT%H:%M:%SZ"),
            elapsed,
            self.tracked,
            self.count(EntityOutcome::Succeeded),
            self.count(EntityOutcome::Partial),
            self.count(EntityOutcome::Failed),
        );
        let failed = self.failed_entities();
        if !failed.is_empty() {
            line.push_str(&format!(" [{}]", failed.join(", ")));
        }
        line
    }
}

/// Everything fetched for one clan, waiting for the persist step.
#[derive(Default)]
struct Collected {
    clan: Option<ClanSnapshot>,
    players: Vec<PlayerSnapshot>,
    wars: Vec<WarRecord>,
    attacks: Vec<WarAttack>,
    raids: Vec<CapitalRaidRecord>,
    cwl: Vec<CwlRound>,
}

/// A history resource that ended in a terminal failure.
struct HistoryFailure {
    resource: &'static str,
    result: FetchResult,
}

impl fmt::Display for HistoryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.resource, self.result)
    }
}

fn history(resource: &'static str) -> impl FnOnce(FetchResult) -> HistoryFailure {
    move |result| HistoryFailure { resource, result }
}

/// Drives collection for every tracked clan.
///
/// Per clan, strictly in order:
///     fetch clan → fetch members → fetch histories → persist
///
/// A terminal failure in a fetch step skips the remaining fetch steps
/// and persists whatever was gathered (partial). A failure fetching
/// the clan itself fails that clan only. Clans never affect each other.
pub struct CollectionOrchestrator {
    client: Arc<GameDataClient>,
    store: Arc<dyn Store>,
    settings: CollectorSettings,
    cancel: CancellationToken,
}

impl CollectionOrchestrator {
    pub fn new(
        client: Arc<GameDataClient>,
        store: Arc<dyn Store>,
        settings: CollectorSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            store,
            settings,
            cancel,
        }
    }

    /// Adds a clan to the tracked set. Returns `false` if it already was.
    pub async fn track(&self, raw_tag: &str) -> anyhow::Result<bool> {
        let tag = util::normalize_tag(raw_tag);
        let added = self.store.track_entity(&tag).await?;
        if added {
            info!("added clan {} to tracking", tag);
        }
        Ok(added)
    }

    /// Merges seeds and discovered clans into the stored set and
    /// returns the size of the resulting set.
    pub async fn bootstrap(&self, boot: &Bootstrap) -> anyhow::Result<usize> {
        for seed in &boot.seeds {
            self.track(seed).await?;
        }

        if let Some(search) = &boot.discovery {
            match self.client.search_clans(search).await {
                Ok(found) => {
                    for clan in found {
                        if self.track(&clan.tag).await? {
                            debug!("discovered {} ({}, {} members)", clan.tag, clan.name, clan.members);
                        }
                    }
                }
                Err(e) => warn!("clan discovery failed: {}", e),
            }
        }

        let tracked = self
            .store
            .tracked_entities()
            .await
            .context("loading tracked clans")?;
        info!("data collector initialized, tracking {} clans", tracked.len());
        Ok(tracked.len())
    }

    /// One full pass over the tracked set, read once at the start.
    pub async fn run_cycle(&self) -> anyhow::Result<CycleRun> {
        let tracked = self
            .store
            .tracked_entities()
            .await
            .context("loading tracked clans")?;

        let mut run = CycleRun::start(tracked.len());
        let started = Instant::now();
        info!("starting collection cycle for {} clans", tracked.len());

        for (i, tag) in tracked.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!("cycle cancelled after {} of {} clans", i, tracked.len());
                break;
            }

            let report = self.collect_entity(tag).await;
            log_report(&report);
            run.reports.push(report);

            if i + 1 < tracked.len() {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = sleep(self.settings.entity_delay) => {}
                }
            }
        }

        info!("{}", run.summary_line(started.elapsed()));
        Ok(run)
    }

    /// Runs one clan through its pipeline. Never fails; problems end
    /// up in the report.
    pub async fn collect_entity(&self, tag: &str) -> EntityReport {
        let mut report = EntityReport::new(tag);
        let mut batch = Collected::default();
        let mut stage = Stage::FetchParent;

        loop {
            if self.cancel.is_cancelled()
                && matches!(stage, Stage::FanOutChildren | Stage::FetchHistories)
            {
                report.short_circuit(stage, "cancelled");
                stage = Stage::Persist;
            }

            stage = match stage {
                Stage::FetchParent => match self.client.get_clan(tag).await {
                    Ok(Some(clan)) => {
                        batch.clan = Some(ClanSnapshot::observe(&clan, util::now_utc()));
                        Stage::FanOutChildren
                    }
                    Ok(None) => {
                        report.fail(stage, "clan not found");
                        Stage::Done
                    }
                    Err(e) => {
                        if e == FetchResult::Forbidden {
                            error!("clan {}: {} (misconfigured credentials?)", tag, e);
                        }
                        report.fail(stage, format!("clan: {e}"));
                        Stage::Done
                    }
                },
                Stage::FanOutChildren => {
                    self.fan_out(&mut batch, &mut report).await;
                    Stage::FetchHistories
                }
                Stage::FetchHistories => {
                    if let Err(failure) = self.fetch_histories(tag, &mut batch).await {
                        if matches!(failure.result, FetchResult::PermanentError(_)) {
                            error!("clan {}: {}", tag, failure);
                        }
                        report.short_circuit(stage, failure.to_string());
                    }
                    Stage::Persist
                }
                Stage::Persist => {
                    self.persist(tag, &batch, &mut report).await;
                    Stage::Done
                }
                Stage::Done => break,
            };
        }

        report
    }

    /// Fetches the first `member_limit` members with bounded concurrency.
    async fn fan_out(&self, batch: &mut Collected, report: &mut EntityReport) {
        let Some(clan) = batch.clan.as_ref() else {
            return;
        };

        let tags: Vec<String> = clan
            .member_tags
            .iter()
            .take(self.settings.member_limit)
            .cloned()
            .collect();
        let client = &self.client;

        let results: Vec<_> = stream::iter(tags)
            .map(|tag| async move {
                let result = client.get_player(&tag).await;
                (tag, result.map(|p| p.map(|p| PlayerSnapshot::observe(&p, util::now_utc()))))
            })
            .buffer_unordered(self.settings.member_concurrency)
            .collect()
            .await;

        for (tag, result) in results {
            match result {
                Ok(Some(snapshot)) => batch.players.push(snapshot),
                Ok(None) => debug!("member {} left or vanished", tag),
                Err(e) => report.error(format!("player {tag}: {e}")),
            }
        }
    }

    /// War log, current war, capital raids, then CWL. The first
    /// terminal failure stops the rest.
    async fn fetch_histories(&self, tag: &str, batch: &mut Collected) -> Result<(), HistoryFailure> {
        let wars = self
            .client
            .get_war_log(tag)
            .await
            .map_err(history("war log"))?;
        batch.wars = wars.iter().filter_map(|w| WarRecord::from_log(tag, w)).collect();
        if batch.wars.len() < wars.len() {
            debug!("{}: {} war log entries without end time", tag, wars.len() - batch.wars.len());
        }

        if let Some(war) = self
            .client
            .get_current_war(tag)
            .await
            .map_err(history("current war"))?
        {
            batch.attacks = WarAttack::from_war(tag, &war);
        }

        let raids = self
            .client
            .get_capital_raid_seasons(tag, self.settings.raid_season_limit)
            .await
            .map_err(history("capital raids"))?;
        batch.raids = raids
            .iter()
            .filter_map(|r| CapitalRaidRecord::from_season(tag, r))
            .collect();

        let Some(group) = self
            .client
            .get_league_group(tag)
            .await
            .map_err(history("league group"))?
        else {
            return Ok(());
        };
        debug!("{}: CWL season {} ({})", tag, group.season, group.state);

        for (idx, round) in group.rounds.iter().enumerate() {
            for war_tag in round.war_tags.iter().filter(|t| t.as_str() != UNDRAWN_WAR_TAG) {
                if self.cancel.is_cancelled() {
                    return Err(HistoryFailure {
                        resource: "cwl war",
                        result: FetchResult::Cancelled,
                    });
                }

                let war = self
                    .client
                    .get_cwl_war(war_tag)
                    .await
                    .map_err(history("cwl war"))?;

                if let Some(round) = war
                    .and_then(|w| CwlRound::from_war(tag, &group.season, idx + 1, war_tag, &w))
                {
                    batch.cwl.push(round);
                }
            }
        }

        Ok(())
    }

    async fn persist(&self, tag: &str, batch: &Collected, report: &mut EntityReport) {
        if let Some(clan) = &batch.clan {
            self.append(Collection::ClansHistory, tag, clan, report).await;
        }
        for player in &batch.players {
            self.append(Collection::PlayersHistory, &player.player_tag, player, report)
                .await;
        }
        for war in &batch.wars {
            let key = DedupKey::new(tag, &war.end_time);
            self.insert_once(Collection::WarsHistory, &key, war, report).await;
        }
        for attack in &batch.attacks {
            self.upsert(Collection::WarAttacks, &attack.key(), attack, report)
                .await;
        }
        for raid in &batch.raids {
            let key = DedupKey::new(tag, &raid.start_time);
            self.insert_once(Collection::CapitalRaidsHistory, &key, raid, report)
                .await;
        }
        for round in &batch.cwl {
            self.upsert(Collection::CwlRounds, &round.war_tag, round, report)
                .await;
        }
    }

    async fn append<T: Serialize>(
        &self,
        collection: Collection,
        entity: &str,
        record: &T,
        report: &mut EntityReport,
    ) {
        let result = match serde_json::to_value(record) {
            Ok(value) => self.store.append(collection, entity, &value).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(()) => {
                report.written += 1;
                METRICS.records_appended.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => store_error(report, collection, entity, e),
        }
    }

    async fn insert_once<T: Serialize>(
        &self,
        collection: Collection,
        key: &DedupKey,
        record: &T,
        report: &mut EntityReport,
    ) {
        let result = match serde_json::to_value(record) {
            Ok(value) => self.store.insert_if_absent(collection, key, &value).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(true) => {
                report.written += 1;
                METRICS.records_upserted.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {
                report.skipped += 1;
                METRICS.dedup_skips.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => store_error(report, collection, &key.to_string(), e),
        }
    }

    async fn upsert<T: Serialize>(
        &self,
        collection: Collection,
        key: &str,
        record: &T,
        report: &mut EntityReport,
    ) {
        let result = match serde_json::to_value(record) {
            Ok(value) => self.store.upsert(collection, key, &value).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(()) => {
                report.written += 1;
                METRICS.records_upserted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => store_error(report, collection, key, e),
        }
    }
}

fn store_error(report: &mut EntityReport, collection: Collection, key: &str, e: anyhow::Error) {
    error!("{}: writing {} {} failed: {:#}", report.tag, collection, key, e);
    METRICS.store_errors.fetch_add(1, Ordering::Relaxed);
    report.error(format!("store {collection} {key}: {e}"));
}

fn log_report(report: &EntityReport) {
    match report.outcome {
        EntityOutcome::Succeeded => info!(
            "collected clan {}: {} written, {} duplicates skipped",
            report.tag, report.written, report.skipped
        ),
        EntityOutcome::Partial => warn!(
            "partially collected clan {} (stopped at {}): {} written, errors: {}",
            report.tag,
            report.stopped_at.map_or_else(|| "-".to_string(), |s| s.to_string()),
            report.written,
            report.errors.join("; ")
        ),
        EntityOutcome::Failed => error!(
            "failed to collect clan {}: {}",
            report.tag,
            report.errors.join("; ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::api::executor::tests::{ScriptedTransport, executor_with};
    use crate::api::executor::{HttpResponse, Transport, TransportError};
    use crate::store::memory::MemoryStore;

    const CLAN_A: &str = r##"{
        "tag": "#A", "name": "Alpha", "clanLevel": 12, "members": 2,
        "memberList": [{"tag": "#P1", "name": "one"}, {"tag": "#P2", "name": "two"}]
    }"##;

    const WAR_LOG_A: &str = r##"{"items": [
        {"result": "win", "endTime": "20240101T000000.000Z", "teamSize": 15,
         "clan": {"tag": "#A", "stars": 40}, "opponent": {"tag": "#X", "stars": 30}},
        {"result": "lose", "endTime": "20240105T000000.000Z", "teamSize": 15,
         "clan": {"tag": "#A", "stars": 20}, "opponent": {"tag": "#Y", "stars": 41}}
    ]}"##;

    const CURRENT_WAR_A: &str = r##"{
        "state": "inWar", "preparationStartTime": "20240110T000000.000Z",
        "clan": {"tag": "#A", "members": [
            {"tag": "#P1", "name": "one", "townhallLevel": 15,
             "attacks": [{"defenderTag": "#E1", "stars": 3, "destructionPercentage": 100.0, "order": 1}]}
        ]},
        "opponent": {"tag": "#X", "members": [{"tag": "#E1", "name": "enemy", "townhallLevel": 14}]}
    }"##;

    const RAIDS_A: &str = r##"{"items": [
        {"state": "ended", "startTime": "20240105T070000.000Z", "endTime": "20240108T070000.000Z",
         "capitalTotalLoot": 300000, "members": [{"tag": "#P1", "name": "one", "attacks": 6, "capitalResourcesLooted": 25000}]}
    ]}"##;

    fn player(tag: &str) -> String {
        format!(r#"{{"tag": "{tag}", "name": "p", "trophies": 5000}}"#)
    }

    fn settings() -> CollectorSettings {
        CollectorSettings {
            entity_delay: Duration::from_secs(2),
            member_limit: 50,
            member_concurrency: 5,
            raid_season_limit: 10,
        }
    }

    /// Scripts a healthy clan `#A` with two members.
    fn script_clan_a(transport: &ScriptedTransport) {
        transport.respond("/clans/%23A", 200, CLAN_A);
        transport.respond("/players/%23P1", 200, &player("#P1"));
        transport.respond("/players/%23P2", 200, &player("#P2"));
        transport.respond("/clans/%23A/warlog", 200, WAR_LOG_A);
        transport.respond("/clans/%23A/currentwar", 200, CURRENT_WAR_A);
        transport.respond("/clans/%23A/capitalraidseasons?limit=10", 200, RAIDS_A);
    }

    fn orchestrator(
        transport: Arc<ScriptedTransport>,
        store: Arc<MemoryStore>,
        settings: CollectorSettings,
        cancel: CancellationToken,
    ) -> CollectionOrchestrator {
        let executor = executor_with(transport.clone(), cancel.clone());
        let client = Arc::new(GameDataClient::new(executor, transport));
        CollectionOrchestrator::new(client, store, settings, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_clan_writes_every_collection() {
        let transport = Arc::new(ScriptedTransport::default());
        script_clan_a(&transport);
        let store = Arc::new(MemoryStore::with_tracked(&["#A"]));
        let orch = orchestrator(transport, store.clone(), settings(), CancellationToken::new());

        let run = orch.run_cycle().await.unwrap();

        assert_eq!(run.count(EntityOutcome::Succeeded), 1);
        let report = &run.reports[0];
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.stopped_at, None);

        assert_eq!(store.count(Collection::ClansHistory).await, 1);
        assert_eq!(store.count(Collection::PlayersHistory).await, 2);
        assert_eq!(store.count(Collection::WarsHistory).await, 2);
        assert_eq!(store.count(Collection::WarAttacks).await, 1);
        assert_eq!(store.count(Collection::CapitalRaidsHistory).await, 1);
        // league group 404s: not in CWL
        assert_eq!(store.count(Collection::CwlRounds).await, 0);

        let raid = store
            .keyed(
                Collection::CapitalRaidsHistory,
                &DedupKey::new("#A", "20240105T070000.000Z"),
            )
            .await
            .unwrap();
        assert_eq!(raid["total_loot"], 300000);
    }

    #[tokio::test(start_paused = true)]
    async fn second_cycle_appends_snapshots_but_not_history() {
        let transport = Arc::new(ScriptedTransport::default());
        script_clan_a(&transport);
        let store = Arc::new(MemoryStore::with_tracked(&["#A"]));
        let orch = orchestrator(transport, store.clone(), settings(), CancellationToken::new());

        orch.run_cycle().await.unwrap();
        let second = orch.run_cycle().await.unwrap();

        assert_eq!(second.reports[0].outcome, EntityOutcome::Succeeded);
        // two war log entries + one raid season seen again
        assert_eq!(second.reports[0].skipped, 3);

        assert_eq!(store.count(Collection::WarsHistory).await, 2);
        assert_eq!(store.count(Collection::CapitalRaidsHistory).await, 1);
        assert_eq!(store.count(Collection::WarAttacks).await, 1);
        assert_eq!(store.appended(Collection::ClansHistory, "#A").await.len(), 2);
        assert_eq!(store.appended(Collection::PlayersHistory, "#P1").await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_clan_does_not_affect_the_next_one() {
        let transport = Arc::new(ScriptedTransport::default());
        script_clan_a(&transport);
        transport.respond("/clans/%23B", 500, "");
        let store = Arc::new(MemoryStore::with_tracked(&["#B", "#A"]));
        let orch = orchestrator(transport.clone(), store.clone(), settings(), CancellationToken::new());

        let run = orch.run_cycle().await.unwrap();

        assert_eq!(run.failed_entities(), vec!["#B"]);
        assert!(run.summary_line(Duration::ZERO).ends_with("1 ok, 0 partial, 1 failed [#B]"));
        assert_eq!(run.count(EntityOutcome::Succeeded), 1);
        assert_eq!(run.reports[0].stopped_at, Some(Stage::FetchParent));

        // retried to exhaustion, then nothing else fetched for #B
        assert_eq!(transport.call_count("/clans/%23B"), 3);
        assert_eq!(transport.call_count("/clans/%23B/warlog"), 0);
        assert!(store.appended(Collection::ClansHistory, "#B").await.is_empty());
        assert_eq!(store.appended(Collection::ClansHistory, "#A").await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_clan_is_failed_without_writes() {
        let transport = Arc::new(ScriptedTransport::default());
        let store = Arc::new(MemoryStore::with_tracked(&["#GONE"]));
        let orch = orchestrator(transport, store.clone(), settings(), CancellationToken::new());

        let report = orch.collect_entity("#GONE").await;

        assert_eq!(report.outcome, EntityOutcome::Failed);
        assert_eq!(report.written, 0);
        assert_eq!(store.count(Collection::ClansHistory).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn history_failure_persists_what_was_gathered() {
        let transport = Arc::new(ScriptedTransport::default());
        script_clan_a(&transport);
        transport.replace("/clans/%23A/warlog", 503, "");
        let store = Arc::new(MemoryStore::with_tracked(&["#A"]));
        let orch = orchestrator(transport.clone(), store.clone(), settings(), CancellationToken::new());

        let report = orch.collect_entity("#A").await;

        assert_eq!(report.outcome, EntityOutcome::Partial);
        assert_eq!(report.stopped_at, Some(Stage::FetchHistories));
        assert_eq!(transport.call_count("/clans/%23A/currentwar"), 0);
        assert_eq!(transport.call_count("/clans/%23A/capitalraidseasons?limit=10"), 0);

        assert_eq!(store.count(Collection::ClansHistory).await, 1);
        assert_eq!(store.count(Collection::PlayersHistory).await, 2);
        assert_eq!(store.count(Collection::WarsHistory).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn member_failure_marks_partial_and_keeps_going() {
        let transport = Arc::new(ScriptedTransport::default());
        script_clan_a(&transport);
        transport.replace("/players/%23P2", 500, "");
        let store = Arc::new(MemoryStore::with_tracked(&["#A"]));
        let orch = orchestrator(transport, store.clone(), settings(), CancellationToken::new());

        let report = orch.collect_entity("#A").await;

        assert_eq!(report.outcome, EntityOutcome::Partial);
        assert_eq!(report.stopped_at, None);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(store.count(Collection::PlayersHistory).await, 1);
        assert_eq!(store.count(Collection::WarsHistory).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn only_the_first_members_are_fetched() {
        let members: Vec<String> = (0..8)
            .map(|i| format!(r##"{{"tag": "#M{i}", "name": "m"}}"##))
            .collect();
        let clan = format!(
            r##"{{"tag": "#C", "name": "Big", "memberList": [{}]}}"##,
            members.join(",")
        );

        let transport = Arc::new(ScriptedTransport::default());
        transport.respond("/clans/%23C", 200, &clan);
        for i in 0..8 {
            transport.respond(&format!("/players/%23M{i}"), 200, &player(&format!("#M{i}")));
        }
        let store = Arc::new(MemoryStore::with_tracked(&["#C"]));
        let mut capped = settings();
        capped.member_limit = 3;
        let orch = orchestrator(transport.clone(), store.clone(), capped, CancellationToken::new());

        orch.collect_entity("#C").await;

        let player_calls = transport
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.starts_with("/players/"))
            .count();
        assert_eq!(player_calls, 3);
        assert_eq!(transport.call_count("/players/%23M7"), 0);
        assert_eq!(store.count(Collection::PlayersHistory).await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cwl_rounds_skip_undrawn_wars_and_foreign_pairings() {
        let transport = Arc::new(ScriptedTransport::default());
        script_clan_a(&transport);
        transport.respond(
            "/clans/%23A/currentwar/leaguegroup",
            200,
            r##"{"state": "inWar", "season": "2024-01",
                 "rounds": [{"warTags": ["#W1", "#W2"]}, {"warTags": ["#0", "#0"]}]}"##,
        );
        transport.respond(
            "/clanwarleagues/wars/%23W1",
            200,
            r##"{"state": "warEnded",
                 "clan": {"tag": "#Q", "stars": 20, "destructionPercentage": 70.0},
                 "opponent": {"tag": "#A", "stars": 25, "destructionPercentage": 80.0}}"##,
        );
        transport.respond(
            "/clanwarleagues/wars/%23W2",
            200,
            r##"{"state": "warEnded", "clan": {"tag": "#R"}, "opponent": {"tag": "#S"}}"##,
        );
        let store = Arc::new(MemoryStore::with_tracked(&["#A"]));
        let orch = orchestrator(transport.clone(), store.clone(), settings(), CancellationToken::new());

        let report = orch.collect_entity("#A").await;

        assert_eq!(report.outcome, EntityOutcome::Succeeded);
        assert_eq!(transport.call_count("/clanwarleagues/wars/%230"), 0);
        assert_eq!(store.count(Collection::CwlRounds).await, 1);

        let round = store.upserted(Collection::CwlRounds, "#W1").await.unwrap();
        assert_eq!(round["round_number"], 1);
        assert_eq!(round["result"], "win");
        assert_eq!(round["opponent_tag"], "#Q");
    }

    /// Holds every request for a while and records the peak number in flight.
    struct SlowTransport {
        inner: ScriptedTransport,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Transport for SlowTransport {
        async fn get(&self, path: &str) -> Result<HttpResponse, TransportError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(200)).await;
            let answer = self.inner.get(path).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            answer
        }
    }

    #[tokio::test(start_paused = true)]
    async fn member_fetches_respect_the_concurrency_bound() {
        let members: Vec<String> = (0..12)
            .map(|i| format!(r##"{{"tag": "#M{i}"}}"##))
            .collect();
        let clan = format!(
            r##"{{"tag": "#C", "name": "Wide", "memberList": [{}]}}"##,
            members.join(",")
        );

        let transport = Arc::new(SlowTransport {
            inner: ScriptedTransport::default(),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        transport.inner.respond("/clans/%23C", 200, &clan);
        for i in 0..12 {
            transport
                .inner
                .respond(&format!("/players/%23M{i}"), 200, &player(&format!("#M{i}")));
        }

        let cancel = CancellationToken::new();
        let executor = executor_with(transport.clone(), cancel.clone());
        let client = Arc::new(GameDataClient::new(executor, transport.clone()));
        let store = Arc::new(MemoryStore::with_tracked(&["#C"]));
        let mut narrow = settings();
        narrow.member_concurrency = 3;
        let orch = CollectionOrchestrator::new(client, store.clone(), narrow, cancel);

        let report = orch.collect_entity("#C").await;

        assert_eq!(report.outcome, EntityOutcome::Succeeded);
        assert_eq!(store.count(Collection::PlayersHistory).await, 12);
        assert_eq!(transport.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn clans_are_paced_but_the_last_one_is_not() {
        // unknown clans fail on the first 404, so only the pacing takes time
        let transport = Arc::new(ScriptedTransport::default());
        let store = Arc::new(MemoryStore::with_tracked(&["#X1", "#X2", "#X3"]));
        let orch = orchestrator(transport, store, settings(), CancellationToken::new());

        let start = Instant::now();
        let run = orch.run_cycle().await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(run.count(EntityOutcome::Failed), 3);
        assert!(elapsed >= Duration::from_secs(4), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(6), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_cycle_collects_nothing_more() {
        let transport = Arc::new(ScriptedTransport::default());
        script_clan_a(&transport);
        let store = Arc::new(MemoryStore::with_tracked(&["#A"]));
        let cancel = CancellationToken::new();
        let orch = orchestrator(transport.clone(), store, settings(), cancel.clone());

        cancel.cancel();
        let run = orch.run_cycle().await.unwrap();

        assert!(run.reports.is_empty());
        assert_eq!(run.tracked, 1);
        assert!(transport.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_merges_seeds_and_discovered_clans() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond(
            "/clans?name=reddit&limit=10",
            200,
            r##"{"items": [{"tag": "#D1", "name": "reddit x", "members": 40}, {"tag": "#A", "name": "alpha"}]}"##,
        );
        let store = Arc::new(MemoryStore::with_tracked(&["#A"]));
        let orch = orchestrator(transport, store.clone(), settings(), CancellationToken::new());

        let boot = Bootstrap {
            seeds: vec!["%23a".to_string(), "2pp".to_string()],
            discovery: Some(ClanSearch {
                name: Some("reddit".to_string()),
                ..ClanSearch::default()
            }),
        };
        let tracked = orch.bootstrap(&boot).await.unwrap();

        assert_eq!(tracked, 3);
        assert_eq!(store.tracked_entities().await.unwrap(), vec!["#A", "#2PP", "#D1"]);
    }
}
