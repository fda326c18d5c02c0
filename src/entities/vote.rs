use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "votes")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub poll_id: i64,
    pub voter_id: String,
    pub candidate_id: i64,
    pub cast_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::poll::Entity",
        from = "Column::PollId",
        to = "super::poll::Column::Id"
    )]
    Poll,
    #[sea_orm(
        belongs_to = "super::poll_candidate::Entity",
        from = "Column::CandidateId",
        to = "super::poll_candidate::Column::Id"
    )]
    PollCandidate,
}

impl Related<super::poll::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Poll.def()
    }
}

impl Related<super::poll_candidate::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PollCandidate.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
