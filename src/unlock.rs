use std::collections::HashSet;

use serde::Serialize;
use uuid::Uuid;

/// How long a lock notice should stay on screen before auto-expiring.
pub const NOTICE_TTL_MS: u64 = 4_000;

/// Content that participates in ordered gating. Ordering is by the explicit
/// order index, never by array position.
pub trait OrderedContent {
    fn content_id(&self) -> Uuid;
    fn order_index(&self) -> i32;
}

impl<T: OrderedContent> OrderedContent for &T {
    fn content_id(&self) -> Uuid {
        (*self).content_id()
    }
    fn order_index(&self) -> i32 {
        (*self).order_index()
    }
}

/// User-visible refusal: a value, not an error path. Handlers surface it as
/// a transient message.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LockNotice {
    pub message: String,
    pub ttl_ms: u64,
}

impl LockNotice {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ttl_ms: NOTICE_TTL_MS,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Navigation {
    Moved { id: Uuid },
    Blocked { notice: LockNotice },
    AtEdge,
}

fn by_order<T: OrderedContent>(items: &[T]) -> Vec<&T> {
    let mut sorted: Vec<&T> = items.iter().collect();
    sorted.sort_by_key(|i| i.order_index());
    sorted
}

/// First item in order is always unlocked; any other item is unlocked iff
/// its immediate predecessor by order index is completed. An unknown id is
/// locked.
pub fn is_unlocked<T: OrderedContent>(
    items: &[T],
    completed: &HashSet<Uuid>,
    id: Uuid,
) -> bool {
    let sorted = by_order(items);
    match sorted.iter().position(|i| i.content_id() == id) {
        Some(0) => true,
        Some(pos) => completed.contains(&sorted[pos - 1].content_id()),
        None => false,
    }
}

/// Attempt to select an item. A locked item yields a notice instead of a
/// silent no-op.
pub fn select<T: OrderedContent>(
    items: &[T],
    completed: &HashSet<Uuid>,
    id: Uuid,
) -> Result<Uuid, LockNotice> {
    if is_unlocked(items, completed, id) {
        Ok(id)
    } else {
        Err(LockNotice::new(
            "Complete the previous lesson to unlock this one",
        ))
    }
}

/// Step forward or backward from the current item. Navigation only lands on
/// an unlocked item; a locked target blocks with a transient notice.
pub fn step<T: OrderedContent>(
    items: &[T],
    completed: &HashSet<Uuid>,
    current: Uuid,
    forward: bool,
) -> Navigation {
    let sorted = by_order(items);
    let Some(pos) = sorted.iter().position(|i| i.content_id() == current) else {
        return Navigation::AtEdge;
    };
    let target = if forward {
        pos.checked_add(1).filter(|p| *p < sorted.len())
    } else {
        pos.checked_sub(1)
    };
    let Some(target) = target else {
        return Navigation::AtEdge;
    };
    let target_id = sorted[target].content_id();
    if is_unlocked(items, completed, target_id) {
        Navigation::Moved { id: target_id }
    } else {
        Navigation::Blocked {
            notice: LockNotice::new("Finish the current lesson before moving on"),
        }
    }
}

/// The next item a learner should work on: the first unlocked, uncompleted
/// item in order.
pub fn next_accessible<T: OrderedContent>(
    items: &[T],
    completed: &HashSet<Uuid>,
) -> Option<Uuid> {
    by_order(items)
        .iter()
        .map(|i| i.content_id())
        .find(|id| !completed.contains(id) && is_unlocked(items, completed, *id))
}
