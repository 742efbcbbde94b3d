//! Dependency-tier buckets used to gate activation.
//!
//! Items arrive sorted by (tier, package, version). A bucket is a contiguous
//! run of items sharing tier and package. An item may start once every item
//! of the previous bucket has finished.

use crate::db::item_repo::ItemView;
use crate::status::PushStatus;

/// Aggregate state of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
    Ready,
    Running,
    Blocked,
    Complete,
}

impl BucketState {
    /// One step of the aggregate fold. Statuses without an entry keep the
    /// current state.
    ///
    /// This is a plain override chain, so the last matching status wins:
    /// `[Succeeded, Pending]` folds to `Running` and `[Pending, Succeeded]`
    /// to `Complete`. A Pending item scanned after a Succeeded one therefore
    /// hides the Complete signal.
    pub fn apply(self, status: PushStatus) -> BucketState {
        match status {
            PushStatus::Succeeded | PushStatus::Failed => BucketState::Complete,
            PushStatus::Pending | PushStatus::InProgress => BucketState::Running,
            PushStatus::Canceled => BucketState::Blocked,
            _ => self,
        }
    }
}

/// Folds statuses in scan order, starting from `Ready`.
pub fn fold_state<I>(statuses: I) -> BucketState
where
    I: IntoIterator<Item = PushStatus>,
{
    statuses
        .into_iter()
        .fold(BucketState::Ready, BucketState::apply)
}

/// What the bucket algorithm needs to know about an item.
pub trait BucketMember {
    fn tier(&self) -> i64;
    fn package(&self) -> Option<&str>;
    fn status(&self) -> PushStatus;
}

impl BucketMember for ItemView {
    fn tier(&self) -> i64 {
        self.dependency_tier
    }

    fn package(&self) -> Option<&str> {
        self.package_id.as_deref()
    }

    fn status(&self) -> PushStatus {
        self.status
    }
}

#[derive(Debug)]
pub struct Bucket<'a, T> {
    pub state: BucketState,
    pub items: Vec<&'a T>,
}

/// Splits sorted items into buckets. A new bucket starts whenever the tier
/// or the package changes.
pub fn partition<T: BucketMember>(items: &[T]) -> Vec<Bucket<'_, T>> {
    let mut buckets: Vec<Bucket<'_, T>> = Vec::new();
    let mut key: Option<(i64, Option<&str>)> = None;

    for item in items {
        let item_key = (item.tier(), item.package());
        if key != Some(item_key) {
            key = Some(item_key);
            buckets.push(Bucket {
                state: BucketState::Ready,
                items: Vec::new(),
            });
        }
        if let Some(bucket) = buckets.last_mut() {
            bucket.items.push(item);
            bucket.state = bucket.state.apply(item.status());
        }
    }

    buckets
}

/// Items to activate now: still `Created`, and either in the first bucket
/// or behind a `Complete` bucket.
pub fn activatable<'a, T: BucketMember>(buckets: &[Bucket<'a, T>]) -> Vec<&'a T> {
    let mut ready = Vec::new();
    for (index, bucket) in buckets.iter().enumerate() {
        let open = index == 0 || buckets[index - 1].state == BucketState::Complete;
        if !open {
            continue;
        }
        ready.extend(
            bucket
                .items
                .iter()
                .copied()
                .filter(|item| item.status() == PushStatus::Created),
        );
    }
    ready
}
