//! On-disk session records
//!
//! Sessions are stored as flat JSON objects. Reading is tolerant of older
//! records: count sessions once tracked only the most recent item in
//! `last_item_id` (earlier still `last_video_id`) alongside an
//! `items_watched` counter. Such an id is folded into the id set and the
//! counter is always rebuilt from the set.

use chrono::{DateTime, Local};
use gatehouse_api::{CountProgress, Session, SessionKind, SessionTerms};
use gatehouse_util::ItemId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{StoreError, StoreResult};

#[derive(Debug, Serialize, Deserialize)]
struct StoredSession {
    kind: SessionKind,
    started_at: DateTime<Local>,
    #[serde(alias = "last_active")]
    last_active_at: DateTime<Local>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ends_at: Option<DateTime<Local>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cooldown_ends_at: Option<DateTime<Local>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_count: Option<u32>,
    #[serde(default, alias = "watched_item_ids", skip_serializing_if = "BTreeSet::is_empty")]
    counted_item_ids: BTreeSet<ItemId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    items_counted: Option<u32>,
    #[serde(default, alias = "last_video_id", skip_serializing)]
    last_item_id: Option<ItemId>,
}

pub(crate) fn encode_session(session: &Session) -> StoreResult<String> {
    let mut record = StoredSession {
        kind: session.kind(),
        started_at: session.started_at,
        last_active_at: session.last_active_at,
        ends_at: None,
        cooldown_ends_at: None,
        target_count: None,
        counted_item_ids: BTreeSet::new(),
        items_counted: None,
        last_item_id: None,
    };

    match &session.terms {
        SessionTerms::Unlimited => {}
        SessionTerms::Duration {
            ends_at,
            cooldown_ends_at,
        } => {
            record.ends_at = Some(*ends_at);
            record.cooldown_ends_at = Some(*cooldown_ends_at);
        }
        SessionTerms::Count(progress) => {
            record.target_count = Some(progress.target_count());
            record.counted_item_ids = progress.counted_item_ids().clone();
            record.items_counted = Some(progress.items_counted());
            record.cooldown_ends_at = progress.cooldown_ends_at();
        }
    }

    Ok(serde_json::to_string(&record)?)
}

pub(crate) fn decode_session(json: &str) -> StoreResult<Session> {
    let record: StoredSession = serde_json::from_str(json)?;

    let terms = match record.kind {
        SessionKind::Unlimited => SessionTerms::Unlimited,
        SessionKind::Duration => {
            let (Some(ends_at), Some(cooldown_ends_at)) = (record.ends_at, record.cooldown_ends_at)
            else {
                return Err(StoreError::Serialization(
                    "duration session without ends_at/cooldown_ends_at".into(),
                ));
            };
            SessionTerms::Duration {
                ends_at,
                cooldown_ends_at,
            }
        }
        SessionKind::Count => {
            let target_count = record.target_count.ok_or_else(|| {
                StoreError::Serialization("count session without target_count".into())
            })?;
            let mut ids = record.counted_item_ids;
            if let Some(legacy) = record.last_item_id {
                ids.insert(legacy);
            }
            SessionTerms::Count(CountProgress::from_parts(
                target_count,
                ids,
                record.cooldown_ends_at,
            ))
        }
    };

    Ok(Session {
        started_at: record.started_at,
        last_active_at: record.last_active_at,
        terms,
    })
}
