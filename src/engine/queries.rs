use crate::model::*;

use super::Engine;

impl Engine {
    /// Live occupancy of a resource. A resource nobody ever claimed reports zero.
    pub async fn usage(&self, resource_id: &ResourceId, token: Option<&Token>, now: Ms) -> Usage {
        let Some(rs) = self.get_resource(resource_id) else {
            return Usage {
                active: 0,
                owned: None,
            };
        };
        let guard = rs.read().await;
        Usage {
            active: guard.active_count(now),
            owned: token.and_then(|t| guard.live_row_of(t, now).map(SlotRow::lease)),
        }
    }

    /// Every physical row of a resource, expired ones included, ordered by slot index.
    pub async fn list_slots(&self, resource_id: &ResourceId) -> Vec<SlotRow> {
        let Some(rs) = self.get_resource(resource_id) else {
            return Vec::new();
        };
        let guard = rs.read().await;
        guard.rows.values().cloned().collect()
    }

    /// Rows expired at `now`, found without waiting on any lock.
    /// Resources busy with a writer are skipped until the next sweep.
    pub fn collect_expired_slots(&self, now: Ms) -> Vec<(ResourceId, SlotIndex)> {
        let mut expired = Vec::new();
        for entry in self.state.iter() {
            if let Ok(guard) = entry.value().try_read() {
                for slot in guard.expired_slots(now) {
                    expired.push((guard.id.clone(), slot));
                }
            }
        }
        expired
    }

    pub fn resource_count(&self) -> usize {
        self.state.len()
    }
}
