//! Stored record shapes.
//!
//! These records are what the downstream analytics layer reads. Two
//! families exist:
//!
//! - Current-state snapshots (players, clans): appended on every
//!   successful fetch, each one a new observation.
//! - History records (wars, raids, attacks, CWL rounds): written once
//!   per natural key; seeing the same event again is a no-op.
//!
//! DESIGN NOTES:
//! - Field names are snake_case; they are the store's schema, not
//!   the upstream API's.
//! - Any change here affects every consumer of the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::models::{
    ClanDetails, PlayerDetails, RaidSeason, WarAttackPayload, WarDetails, WarLogEntry, WarMember,
    WarSide,
};
use crate::util;

// ------------------------------------------------------------
// Player snapshot
// ------------------------------------------------------------
//
// Time-series observation of one player. Used for trophy
// trajectories, donation patterns and activity trends.
//
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlayerSnapshot {
    pub player_tag: String,
    pub snapshot_time: DateTime<Utc>,

    pub name: String,
    pub town_hall_level: i64,

    pub trophies: i64,
    pub best_trophies: i64,

    pub war_stars: i64,
    pub attack_wins: i64,
    pub defense_wins: i64,

    pub donations: i64,
    pub donations_received: i64,

    pub clan_tag: Option<String>,
    pub clan_name: Option<String>,
    /// member, admin, coLeader, leader
    pub clan_role: Option<String>,

    pub league_name: Option<String>,
    pub experience_level: i64,
}

impl PlayerSnapshot {
    pub fn observe(p: &PlayerDetails, at: DateTime<Utc>) -> Self {
        let clan = p.clan.clone().unwrap_or_default();
        Self {
            player_tag: p.tag.clone(),
            snapshot_time: at,
            name: p.name.clone(),
            town_hall_level: p.town_hall_level,
            trophies: p.trophies,
            best_trophies: p.best_trophies,
            war_stars: p.war_stars,
            attack_wins: p.attack_wins,
            defense_wins: p.defense_wins,
            donations: p.donations,
            donations_received: p.donations_received,
            clan_tag: clan.tag,
            clan_name: clan.name,
            clan_role: p.role.clone(),
            league_name: p.league.as_ref().and_then(|l| l.name.clone()),
            experience_level: p.exp_level,
        }
    }
}

// ------------------------------------------------------------
// Clan snapshot
// ------------------------------------------------------------
//
// `member_tags` keeps the full roster (not only the fetched
// subset) so membership churn can be reconstructed later.
//
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ClanSnapshot {
    pub clan_tag: String,
    pub snapshot_time: DateTime<Utc>,

    pub name: String,
    pub clan_level: i64,

    pub member_count: i64,
    pub member_tags: Vec<String>,

    pub war_wins: i64,
    pub war_ties: i64,
    pub war_losses: i64,
    pub war_win_streak: i64,
    pub is_war_log_public: bool,
    pub war_league: Option<String>,

    pub clan_capital_points: i64,
    pub clan_capital_league: Option<String>,

    pub required_trophies: i64,
    /// always, often, sometimes, rarely, never, unknown
    pub war_frequency: String,
    pub location_name: Option<String>,
}

impl ClanSnapshot {
    pub fn observe(c: &ClanDetails, at: DateTime<Utc>) -> Self {
        Self {
            clan_tag: c.tag.clone(),
            snapshot_time: at,
            name: c.name.clone(),
            clan_level: c.clan_level,
            member_count: c.members,
            member_tags: c.member_list.iter().map(|m| m.tag.clone()).collect(),
            war_wins: c.war_wins,
            war_ties: c.war_ties,
            war_losses: c.war_losses,
            war_win_streak: c.war_win_streak,
            is_war_log_public: c.is_war_log_public,
            war_league: c.war_league.as_ref().and_then(|l| l.name.clone()),
            clan_capital_points: c.clan_capital_points,
            clan_capital_league: c.capital_league.as_ref().and_then(|l| l.name.clone()),
            required_trophies: c.required_trophies,
            war_frequency: c.war_frequency.clone().unwrap_or_else(|| "unknown".to_string()),
            location_name: c.location.as_ref().and_then(|l| l.name.clone()),
        }
    }
}

// ------------------------------------------------------------
// War record (war log entry)
// ------------------------------------------------------------
//
// Natural key: (clan_tag, end_time). Entries without an end time
// cannot be keyed and are skipped by the collector.
//
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WarRecord {
    pub clan_tag: String,
    /// win, lose, tie, unknown
    pub result: String,
    pub end_time: String,
    pub team_size: i64,

    pub clan_stars: i64,
    pub clan_destruction_percentage: f64,
    pub clan_attacks: i64,

    pub opponent_tag: Option<String>,
    pub opponent_name: Option<String>,
    pub opponent_stars: i64,
    pub opponent_destruction_percentage: f64,

    pub is_cwl: bool,
}

impl WarRecord {
    pub fn from_log(clan_tag: &str, w: &WarLogEntry) -> Option<Self> {
        let end_time = w.end_time.clone().filter(|t| !t.is_empty())?;
        Some(Self {
            clan_tag: clan_tag.to_string(),
            result: w.result.clone().unwrap_or_else(|| "unknown".to_string()),
            end_time,
            team_size: w.team_size,
            clan_stars: w.clan.stars,
            clan_destruction_percentage: w.clan.destruction_percentage,
            clan_attacks: w.clan.attacks,
            opponent_tag: w.opponent.tag.clone(),
            opponent_name: w.opponent.name.clone(),
            opponent_stars: w.opponent.stars,
            opponent_destruction_percentage: w.opponent.destruction_percentage,
            is_cwl: false,
        })
    }
}

// ------------------------------------------------------------
// War attack
// ------------------------------------------------------------
//
// Composite key: (war_id, attacker_tag, attack_order).
// Attacks of an ongoing war are re-written every cycle until the
// war ends; the upsert keeps exactly one row per attack.
//
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WarAttack {
    pub war_id: String,
    pub clan_tag: String,

    pub attacker_tag: String,
    pub attacker_name: String,
    pub attacker_th_level: i64,

    pub defender_tag: String,
    pub defender_name: String,
    pub defender_th_level: i64,

    pub stars: i64,
    pub destruction_percentage: f64,
    pub attack_order: i64,
}

/// Max length of a war id.
const WAR_ID_MAX: usize = 50;

impl WarAttack {
    /// `{clan_tag}_{preparationStartTime}`, capped at 50 chars.
    pub fn war_id(clan_tag: &str, war: &WarDetails) -> String {
        let prep = war.preparation_start_time.as_deref().unwrap_or_default();
        util::truncate_chars(&format!("{clan_tag}_{prep}"), WAR_ID_MAX)
    }

    /// Every attack made by `clan_tag`'s side of the war.
    pub fn from_war(clan_tag: &str, war: &WarDetails) -> Vec<Self> {
        let war_id = Self::war_id(clan_tag, war);
        let defenders = &war.opponent.members;

        war.clan
            .members
            .iter()
            .flat_map(|member| {
                member
                    .attacks
                    .iter()
                    .map(|a| Self::from_attack(&war_id, clan_tag, member, a, defenders))
            })
            .collect()
    }

    fn from_attack(
        war_id: &str,
        clan_tag: &str,
        attacker: &WarMember,
        a: &WarAttackPayload,
        defenders: &[WarMember],
    ) -> Self {
        let defender = defenders.iter().find(|d| d.tag == a.defender_tag);
        Self {
            war_id: war_id.to_string(),
            clan_tag: clan_tag.to_string(),
            attacker_tag: attacker.tag.clone(),
            attacker_name: attacker.name.clone(),
            attacker_th_level: attacker.townhall_level,
            defender_tag: a.defender_tag.clone(),
            defender_name: defender.map(|d| d.name.clone()).unwrap_or_default(),
            defender_th_level: defender.map(|d| d.townhall_level).unwrap_or_default(),
            stars: a.stars,
            destruction_percentage: a.destruction_percentage,
            attack_order: a.order,
        }
    }

    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.war_id, self.attacker_tag, self.attack_order)
    }
}

// ------------------------------------------------------------
// Capital raid season
// ------------------------------------------------------------
//
// Natural key: (clan_tag, start_time). Member contributions are
// kept inline for free-rider analysis.
//
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MemberContribution {
    pub tag: String,
    pub name: String,
    pub capital_resources_looted: i64,
    pub attacks: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CapitalRaidRecord {
    pub clan_tag: String,
    pub start_time: String,
    pub end_time: String,
    /// ongoing, ended
    pub state: String,

    pub total_loot: i64,
    pub raids_completed: i64,
    pub total_attacks: i64,
    pub enemy_districts_destroyed: i64,
    pub offensive_reward: i64,
    pub defensive_reward: i64,

    pub member_contributions: Vec<MemberContribution>,
}

impl CapitalRaidRecord {
    pub fn from_season(clan_tag: &str, r: &RaidSeason) -> Option<Self> {
        let start_time = r.start_time.clone().filter(|t| !t.is_empty())?;
        Some(Self {
            clan_tag: clan_tag.to_string(),
            start_time,
            end_time: r.end_time.clone().unwrap_or_default(),
            state: r.state.clone().unwrap_or_else(|| "ended".to_string()),
            total_loot: r.capital_total_loot,
            raids_completed: r.raids_completed,
            total_attacks: r.total_attacks,
            enemy_districts_destroyed: r.enemy_districts_destroyed,
            offensive_reward: r.offensive_reward,
            defensive_reward: r.defensive_reward,
            member_contributions: r
                .members
                .iter()
                .map(|m| MemberContribution {
                    tag: m.tag.clone(),
                    name: m.name.clone(),
                    capital_resources_looted: m.capital_resources_looted,
                    attacks: m.attacks,
                })
                .collect(),
        })
    }
}

// ------------------------------------------------------------
// CWL round
// ------------------------------------------------------------
//
// Natural key: war_tag. The tracked clan may appear on either side
// of a league war; the record is always written from its point of
// view.
//
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CwlRound {
    pub clan_tag: String,
    /// YYYY-MM
    pub season: String,
    /// 1-based
    pub round_number: usize,
    pub war_tag: String,
    /// preparation, inWar, warEnded
    pub state: String,
    /// win, lose, tie, pending
    pub result: String,

    pub clan_stars: i64,
    pub clan_destruction: f64,
    pub clan_attacks_used: i64,

    pub opponent_tag: String,
    pub opponent_name: String,
    pub opponent_stars: i64,
    pub opponent_destruction: f64,
}

impl CwlRound {
    /// `None` when `clan_tag` is on neither side of the war.
    pub fn from_war(
        clan_tag: &str,
        season: &str,
        round_number: usize,
        war_tag: &str,
        war: &WarDetails,
    ) -> Option<Self> {
        let is = |side: &WarSide| side.tag.as_deref() == Some(clan_tag);
        let (ours, theirs) = if is(&war.clan) {
            (&war.clan, &war.opponent)
        } else if is(&war.opponent) {
            (&war.opponent, &war.clan)
        } else {
            return None;
        };

        Some(Self {
            clan_tag: clan_tag.to_string(),
            season: season.to_string(),
            round_number,
            war_tag: war_tag.to_string(),
            state: war.state.clone(),
            result: war_result(&war.state, ours, theirs).to_string(),
            clan_stars: ours.stars,
            clan_destruction: ours.destruction_percentage,
            clan_attacks_used: ours.attacks,
            opponent_tag: theirs.tag.clone().unwrap_or_default(),
            opponent_name: theirs.name.clone().unwrap_or_default(),
            opponent_stars: theirs.stars,
            opponent_destruction: theirs.destruction_percentage,
        })
    }
}

/// Stars decide, destruction breaks ties.
fn war_result(state: &str, ours: &WarSide, theirs: &WarSide) -> &'static str {
    if state != "warEnded" {
        return "pending";
    }
    match ours.stars.cmp(&theirs.stars) {
        std::cmp::Ordering::Greater => "win",
        std::cmp::Ordering::Less => "lose",
        std::cmp::Ordering::Equal => {
            match ours
                .destruction_percentage
                .partial_cmp(&theirs.destruction_percentage)
            {
                Some(std::cmp::Ordering::Greater) => "win",
                Some(std::cmp::Ordering::Less) => "lose",
                _ => "tie",
            }
        }
    }
}
