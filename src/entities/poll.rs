use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "polls")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub title: String,
    pub description: String,
    pub start_at: DateTimeWithTimeZone,
    pub end_at: DateTimeWithTimeZone,
    pub visibility: String, // "public" | "restricted"
    pub allowed_domains: Json,
    pub poll_type: String, // "single" | "multiple" | "ranked"
    pub status: String,    // cached projection of (start_at, end_at, now)
    pub total_votes: i64,
    pub created_by: String,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::poll_candidate::Entity")]
    PollCandidate,
    #[sea_orm(has_many = "super::vote::Entity")]
    Vote,
}

impl Related<super::poll_candidate::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PollCandidate.def()
    }
}

impl Related<super::vote::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Vote.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
