use std::sync::Arc;

use log::{error, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::api::executor::{FetchResult, RequestExecutor, Transport};
use crate::api::models::{
    ClanDetails, ClanSearch, ClanSummary, ItemList, LeagueGroup, PlayerDetails, RaidSeason,
    WarDetails, WarLogEntry,
};

/// Typed view of a terminal [`FetchResult`]:
/// - `Ok(Some(T))`: data
/// - `Ok(None)`: legitimately nothing there (404, private log, ...)
/// - `Err(FetchResult)`: a failure the caller should record
pub type Fetched<T> = Result<Option<T>, FetchResult>;

/// One method per upstream resource.
///
/// Every method:
/// - percent-encodes identifiers (`#` becomes `%23`)
/// - goes through the shared [`RequestExecutor`] (rate limit + retry)
/// - maps the payload into a typed model
pub struct GameDataClient {
    executor: RequestExecutor,
    transport: Arc<dyn Transport>,
}

impl GameDataClient {
    /// `transport` must be the same instance the executor sends through;
    /// the client only keeps it to release the pool on shutdown.
    pub fn new(executor: RequestExecutor, transport: Arc<dyn Transport>) -> Self {
        Self { executor, transport }
    }

    pub async fn get_clan(&self, clan_tag: &str) -> Fetched<ClanDetails> {
        let path = format!("/clans/{}", encode_tag(clan_tag));
        self.fetch_one(&path).await
    }

    pub async fn get_player(&self, player_tag: &str) -> Fetched<PlayerDetails> {
        let path = format!("/players/{}", encode_tag(player_tag));
        self.fetch_one(&path).await
    }

    /// A private war log answers 403; that is "no data", not a fault.
    pub async fn get_war_log(&self, clan_tag: &str) -> Result<Vec<WarLogEntry>, FetchResult> {
        let path = format!("/clans/{}/warlog", encode_tag(clan_tag));
        self.fetch_list(&path, true).await
    }

    /// Returns `None` when the clan is not in war or hides it.
    pub async fn get_current_war(&self, clan_tag: &str) -> Fetched<WarDetails> {
        let path = format!("/clans/{}/currentwar", encode_tag(clan_tag));
        match self.fetch_one::<WarDetails>(&path).await {
            Ok(Some(war)) if war.is_active() => Ok(Some(war)),
            Ok(_) | Err(FetchResult::Forbidden) => Ok(None),
            Err(other) => Err(other),
        }
    }

    /// Outside the CWL season the group endpoint answers 404.
    pub async fn get_league_group(&self, clan_tag: &str) -> Fetched<LeagueGroup> {
        let path = format!("/clans/{}/currentwar/leaguegroup", encode_tag(clan_tag));
        self.fetch_one(&path).await
    }

    pub async fn get_cwl_war(&self, war_tag: &str) -> Fetched<WarDetails> {
        let path = format!("/clanwarleagues/wars/{}", encode_tag(war_tag));
        self.fetch_one(&path).await
    }

    pub async fn get_capital_raid_seasons(
        &self,
        clan_tag: &str,
        limit: u32,
    ) -> Result<Vec<RaidSeason>, FetchResult> {
        let path = format!(
            "/clans/{}/capitalraidseasons?limit={}",
            encode_tag(clan_tag),
            limit
        );
        self.fetch_list(&path, false).await
    }

    pub async fn search_clans(&self, search: &ClanSearch) -> Result<Vec<ClanSummary>, FetchResult> {
        let path = format!("/clans?{}", search_query(search));
        self.fetch_list(&path, false).await
    }

    /// Releases the connection pool.
    pub async fn close(&self) {
        self.transport.close().await;
    }

    async fn fetch_one<T: DeserializeOwned>(&self, path: &str) -> Fetched<T> {
        match self.executor.execute(path).await {
            FetchResult::Success(body) => decode(path, body).map(Some),
            FetchResult::NotFound => Ok(None),
            other => Err(other),
        }
    }

    async fn fetch_list<T: DeserializeOwned>(
        &self,
        path: &str,
        forbidden_is_empty: bool,
    ) -> Result<Vec<T>, FetchResult> {
        match self.executor.execute(path).await {
            FetchResult::Success(body) => decode::<ItemList<T>>(path, body).map(|l| l.items),
            FetchResult::NotFound => Ok(Vec::new()),
            FetchResult::Forbidden if forbidden_is_empty => {
                warn!("{} is private, treating as empty", path);
                Ok(Vec::new())
            }
            other => Err(other),
        }
    }
}

fn decode<T: DeserializeOwned>(path: &str, body: Value) -> Result<T, FetchResult> {
    serde_json::from_value(body).map_err(|e| {
        error!("unexpected payload shape from {}: {}", path, e);
        FetchResult::PermanentError(format!("unexpected payload shape: {e}"))
    })
}

/// Percent-encodes a tag for use as one path segment.
pub fn encode_tag(tag: &str) -> String {
    urlencoding::encode(tag).into_owned()
}

fn search_query(search: &ClanSearch) -> String {
    let mut params: Vec<String> = Vec::new();

    if let Some(name) = search.name.as_deref().filter(|n| !n.is_empty()) {
        params.push(format!("name={}", urlencoding::encode(name)));
    }
    if let Some(freq) = search.war_frequency.as_deref().filter(|f| !f.is_empty()) {
        params.push(format!("warFrequency={}", urlencoding::encode(freq)));
    }
    if let Some(location) = search.location_id {
        params.push(format!("locationId={location}"));
    }
    if let Some(min) = search.min_members {
        params.push(format!("minMembers={min}"));
    }
    params.push(format!("limit={}", search.limit));

    params.join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::executor::tests::{ScriptedTransport, executor_with};
    use tokio_util::sync::CancellationToken;

    fn client(transport: Arc<ScriptedTransport>) -> GameDataClient {
        GameDataClient::new(
            executor_with(transport.clone(), CancellationToken::new()),
            transport,
        )
    }

    #[test]
    fn tags_are_percent_encoded() {
        assert_eq!(encode_tag("#2PP"), "%232PP");
        assert_eq!(encode_tag("#A/B?"), "%23A%2FB%3F");
    }

    #[test]
    fn search_query_skips_unset_fields() {
        let search = ClanSearch {
            name: Some("war farm".into()),
            min_members: Some(30),
            ..ClanSearch::default()
        };
        assert_eq!(search_query(&search), "name=war%20farm&minMembers=30&limit=10");
    }

    #[tokio::test(start_paused = true)]
    async fn clan_lookup_hits_encoded_path() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond(
            "/clans/%232PP",
            200,
            r##"{"tag":"#2PP","name":"Alpha","clanLevel":12,"members":2,
                "memberList":[{"tag":"#P1","name":"a"},{"tag":"#P2","name":"b"}]}"##,
        );
        let client = client(transport.clone());

        let clan = client.get_clan("#2PP").await.unwrap().unwrap();
        assert_eq!(clan.name, "Alpha");
        assert_eq!(clan.member_list.len(), 2);
        assert_eq!(transport.call_count("/clans/%232PP"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_resources_are_empty_not_errors() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond("/clans/%23PRIV/warlog", 403, "");
        transport.respond("/clans/%23PRIV/currentwar", 403, "");
        let client = client(transport.clone());

        assert!(client.get_war_log("#PRIV").await.unwrap().is_empty());
        assert!(client.get_current_war("#PRIV").await.unwrap().is_none());
        assert!(client.get_player("#GONE").await.unwrap().is_none());
        assert!(client.get_league_group("#PRIV").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn forbidden_clan_lookup_is_surfaced() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond("/clans/%23X", 403, "");
        let client = client(transport);

        assert_eq!(client.get_clan("#X").await.unwrap_err(), FetchResult::Forbidden);
    }

    #[tokio::test(start_paused = true)]
    async fn list_payloads_are_unwrapped() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond(
            "/clans/%232PP/capitalraidseasons?limit=3",
            200,
            r##"{"items":[{"startTime":"20240105T070000.000Z","capitalTotalLoot":1000,
                "members":[{"tag":"#P1","name":"a","attacks":6,"capitalResourcesLooted":900}]}],
                "paging":{"cursors":{}}}"##,
        );
        transport.respond("/clans/%232PP/warlog", 200, r#"{"paging":{}}"#);
        let client = client(transport);

        let raids = client.get_capital_raid_seasons("#2PP", 3).await.unwrap();
        assert_eq!(raids.len(), 1);
        assert_eq!(raids[0].capital_total_loot, 1000);
        assert_eq!(raids[0].members[0].capital_resources_looted, 900);

        assert!(client.get_war_log("#2PP").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_shape_is_a_permanent_error() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond("/players/%23P1", 200, r#"{"unexpected":true}"#);
        let client = client(transport);

        assert!(matches!(
            client.get_player("#P1").await,
            Err(FetchResult::PermanentError(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn not_in_war_is_none() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond("/clans/%232PP/currentwar", 200, r#"{"state":"notInWar"}"#);
        let client = client(transport);

        assert!(client.get_current_war("#2PP").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn search_returns_items() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.respond(
            "/clans?name=alpha&limit=2",
            200,
            r##"{"items":[{"tag":"#A1","name":"alpha","members":40},{"tag":"#A2","name":"alpha 2"}]}"##,
        );
        let client = client(transport);

        let found = client
            .search_clans(&ClanSearch {
                name: Some("alpha".into()),
                limit: 2,
                ..ClanSearch::default()
            })
            .await
            .unwrap();

        assert_eq!(found.iter().map(|c| c.tag.as_str()).collect::<Vec<_>>(), ["#A1", "#A2"]);
    }
}
