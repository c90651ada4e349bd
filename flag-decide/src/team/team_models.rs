use serde::{Deserialize, Serialize};

pub const TEAM_TOKEN_CACHE_PREFIX: &str = "flag_decide:team_token:";

pub type TeamId = i32;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, sqlx::FromRow)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
    pub api_token: String,
}
