//! Rebuild turns from persisted content records.

use std::collections::HashMap;

use uuid::Uuid;

use crate::conversation::model::{Content, Role, Turn, TurnKind, TurnStatus};

/// Group persisted contents into turns.
///
/// Contents are grouped by `turn_id` and sorted by timestamp. A turn whose
/// first content is user-authored is a user turn. Hydrated turns are always
/// `complete`; turns are ordered by their earliest content.
pub fn hydrate_turns(thread_id: Uuid, contents: Vec<Content>) -> Vec<Turn> {
    let mut groups: HashMap<Uuid, Vec<Content>> = HashMap::new();
    for content in contents {
        groups.entry(content.turn_id).or_default().push(content);
    }

    let mut turns: Vec<Turn> = groups
        .into_iter()
        .map(|(turn_id, mut contents)| {
            contents.sort_by_key(|c| c.timestamp);
            let kind = match contents.first().map(|c| c.role) {
                Some(Role::User) => TurnKind::User,
                _ => TurnKind::Assistant,
            };
            Turn {
                id: turn_id,
                thread_id,
                kind,
                status: TurnStatus::Complete,
                contents,
            }
        })
        .collect();

    turns.sort_by_key(|t| t.contents.first().map(|c| c.timestamp));
    turns
}
