//! Upstream payload shapes.
//!
//! Only the fields the collector stores are modelled; everything else
//! in the JSON is ignored. Optional counters default to zero because
//! the API omits them for new players and clans.

use serde::Deserialize;

/// List-shaped responses wrap their collection under `items`.
#[derive(Debug, Deserialize)]
pub struct ItemList<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Named {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TagRef {
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Member list entries only contribute their tag; the full player is
/// fetched separately.
#[derive(Debug, Clone, Deserialize)]
pub struct ClanMember {
    pub tag: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClanDetails {
    pub tag: String,
    pub name: String,
    #[serde(default)]
    pub clan_level: i64,
    #[serde(default)]
    pub members: i64,
    #[serde(default)]
    pub member_list: Vec<ClanMember>,
    #[serde(default)]
    pub war_wins: i64,
    #[serde(default)]
    pub war_ties: i64,
    #[serde(default)]
    pub war_losses: i64,
    #[serde(default)]
    pub war_win_streak: i64,
    #[serde(default)]
    pub is_war_log_public: bool,
    #[serde(default)]
    pub war_league: Option<Named>,
    #[serde(default)]
    pub clan_capital_points: i64,
    #[serde(default)]
    pub capital_league: Option<Named>,
    #[serde(default)]
    pub required_trophies: i64,
    #[serde(default)]
    pub war_frequency: Option<String>,
    #[serde(default)]
    pub location: Option<Named>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerDetails {
    pub tag: String,
    pub name: String,
    #[serde(default)]
    pub town_hall_level: i64,
    #[serde(default)]
    pub trophies: i64,
    #[serde(default)]
    pub best_trophies: i64,
    #[serde(default)]
    pub war_stars: i64,
    #[serde(default)]
    pub attack_wins: i64,
    #[serde(default)]
    pub defense_wins: i64,
    #[serde(default)]
    pub donations: i64,
    #[serde(default)]
    pub donations_received: i64,
    #[serde(default)]
    pub clan: Option<TagRef>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub league: Option<Named>,
    #[serde(default)]
    pub exp_level: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarAttackPayload {
    pub defender_tag: String,
    #[serde(default)]
    pub stars: i64,
    #[serde(default)]
    pub destruction_percentage: f64,
    #[serde(default)]
    pub order: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarMember {
    pub tag: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub townhall_level: i64,
    #[serde(default)]
    pub attacks: Vec<WarAttackPayload>,
}

/// One side of a war, as reported by the war log, the current war
/// and CWL war endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarSide {
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub stars: i64,
    #[serde(default)]
    pub destruction_percentage: f64,
    #[serde(default)]
    pub attacks: i64,
    #[serde(default)]
    pub members: Vec<WarMember>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarLogEntry {
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub team_size: i64,
    #[serde(default)]
    pub clan: WarSide,
    #[serde(default)]
    pub opponent: WarSide,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarDetails {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub preparation_start_time: Option<String>,
    #[serde(default)]
    pub clan: WarSide,
    #[serde(default)]
    pub opponent: WarSide,
}

impl WarDetails {
    pub fn is_active(&self) -> bool {
        !self.state.is_empty() && self.state != "notInWar"
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeagueRound {
    #[serde(default)]
    pub war_tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeagueGroup {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub season: String,
    #[serde(default)]
    pub rounds: Vec<LeagueRound>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaidMember {
    pub tag: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub attacks: i64,
    #[serde(default)]
    pub capital_resources_looted: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaidSeason {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default, alias = "totalLoot")]
    pub capital_total_loot: i64,
    #[serde(default)]
    pub raids_completed: i64,
    #[serde(default)]
    pub total_attacks: i64,
    #[serde(default)]
    pub enemy_districts_destroyed: i64,
    #[serde(default)]
    pub defensive_reward: i64,
    #[serde(default)]
    pub offensive_reward: i64,
    #[serde(default)]
    pub members: Vec<RaidMember>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClanSummary {
    pub tag: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub members: i64,
}

/// Criteria for the clan search endpoint. Unset fields are omitted
/// from the query string.
#[derive(Debug, Clone, Deserialize)]
pub struct ClanSearch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub war_frequency: Option<String>,
    #[serde(default)]
    pub location_id: Option<i64>,
    #[serde(default)]
    pub min_members: Option<i64>,
    #[serde(default = "default_search_limit")]
    pub limit: u32,
}

fn default_search_limit() -> u32 {
    10
}

impl Default for ClanSearch {
    fn default() -> Self {
        Self {
            name: None,
            war_frequency: None,
            location_id: None,
            min_members: None,
            limit: default_search_limit(),
        }
    }
}
