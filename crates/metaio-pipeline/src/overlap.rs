//! Range overlap checking
//!
//! One [`RangeOverlapChecker`] per (array, tier) tracks which pages have
//! I/O outstanding. Writes hold a page exclusively (one bit per page);
//! reads share it through a reader count. A request that touches a busy
//! page, or a page with requests already waiting on it, is parked on that
//! page's pending list and handed back in arrival order when the page
//! becomes free. Nothing is ever rejected here.

use crate::request::Request;
use metaio_common::{ArrayId, Lpn, StorageTier};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::trace;

/// Result of an admission attempt
#[derive(Debug)]
pub enum Admission {
    /// Pages are locked; the request may be built
    Granted {
        request: Request,
        locked: Vec<Lpn>,
    },
    /// Parked on the pending list of a conflicting page
    Deferred,
}

/// Outstanding-I/O tracker for one (array, tier)
#[derive(Debug)]
pub struct RangeOverlapChecker {
    array_id: ArrayId,
    tier: StorageTier,
    max_lpn: Lpn,
    /// Bit set while a write owns the page
    write_locked: Vec<u64>,
    readers: HashMap<Lpn, u32>,
    pending: BTreeMap<Lpn, VecDeque<Request>>,
    pending_count: usize,
}

impl RangeOverlapChecker {
    #[must_use]
    pub fn new(array_id: ArrayId, tier: StorageTier, max_lpn: Lpn) -> Self {
        let words = usize::try_from(max_lpn / 64 + 1).unwrap_or(usize::MAX);
        Self {
            array_id,
            tier,
            max_lpn,
            write_locked: vec![0; words],
            readers: HashMap::new(),
            pending: BTreeMap::new(),
            pending_count: 0,
        }
    }

    #[must_use]
    pub const fn max_lpn(&self) -> Lpn {
        self.max_lpn
    }

    /// Whether every page of `request` lies inside this checker's range
    #[must_use]
    pub fn covers(&self, request: &Request) -> bool {
        request.pages().all(|lpn| lpn <= self.max_lpn)
    }

    fn word_bit(lpn: Lpn) -> (usize, u64) {
        ((lpn / 64) as usize, 1 << (lpn % 64))
    }

    /// Whether a write currently owns `lpn`
    #[must_use]
    pub fn is_write_locked(&self, lpn: Lpn) -> bool {
        let (word, bit) = Self::word_bit(lpn);
        self.write_locked.get(word).is_some_and(|w| w & bit != 0)
    }

    fn set_write_locked(&mut self, lpn: Lpn, locked: bool) {
        let (word, bit) = Self::word_bit(lpn);
        if let Some(w) = self.write_locked.get_mut(word) {
            if locked {
                *w |= bit;
            } else {
                *w &= !bit;
            }
        }
    }

    #[must_use]
    pub fn reader_count(&self, lpn: Lpn) -> u32 {
        self.readers.get(&lpn).copied().unwrap_or(0)
    }

    /// First page that keeps `request` from proceeding, if any
    #[must_use]
    pub fn conflict(&self, request: &Request) -> Option<Lpn> {
        let is_write = request.direction.is_write();
        request.pages().find(|&lpn| {
            self.is_write_locked(lpn)
                || (is_write && self.reader_count(lpn) > 0)
                || self.pending.contains_key(&lpn)
        })
    }

    /// Admit `request` or park it behind the page it conflicts on
    pub fn admit(&mut self, request: Request) -> Admission {
        if let Some(lpn) = self.conflict(&request) {
            self.defer(lpn, request);
            return Admission::Deferred;
        }
        let locked = self.lock(&request);
        Admission::Granted { request, locked }
    }

    /// Mark every page of `request` busy; returns the pages locked
    pub fn lock(&mut self, request: &Request) -> Vec<Lpn> {
        let mut pages: Vec<Lpn> = request.pages().collect();
        pages.sort_unstable();
        pages.dedup();
        for &lpn in &pages {
            if request.direction.is_write() {
                self.set_write_locked(lpn, true);
            } else {
                *self.readers.entry(lpn).or_insert(0) += 1;
            }
        }
        trace!(
            array_id = self.array_id,
            tier = %self.tier,
            request_id = request.id,
            pages = pages.len(),
            "pages locked"
        );
        pages
    }

    /// Park `request` until `lpn` frees up
    pub fn defer(&mut self, lpn: Lpn, mut request: Request) {
        request.deferrals += 1;
        trace!(array_id = self.array_id, lpn, request_id = request.id, "request deferred on page");
        self.pending.entry(lpn).or_default().push_back(request);
        self.pending_count += 1;
    }

    /// Drop one hold on `lpn`
    ///
    /// Once the page is entirely free, every request waiting on it is
    /// returned in arrival order for re-admission.
    pub fn release(&mut self, lpn: Lpn, was_write: bool) -> Vec<Request> {
        if was_write {
            self.set_write_locked(lpn, false);
        } else if let Some(count) = self.readers.get_mut(&lpn) {
            *count -= 1;
            if *count == 0 {
                self.readers.remove(&lpn);
            }
        }

        if self.is_write_locked(lpn) || self.reader_count(lpn) > 0 {
            return Vec::new();
        }
        let waiting: Vec<Request> = self.pending.remove(&lpn).map(Vec::from).unwrap_or_default();
        self.pending_count -= waiting.len();
        waiting
    }

    /// Requests parked on `lpn`
    #[must_use]
    pub fn pending_len(&self, lpn: Lpn) -> usize {
        self.pending.get(&lpn).map_or(0, VecDeque::len)
    }

    #[must_use]
    pub const fn pending_total(&self) -> usize {
        self.pending_count
    }

    /// No locks held and nobody waiting
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending_count == 0
            && self.readers.is_empty()
            && self.write_locked.iter().all(|&w| w == 0)
    }

    /// Remove every parked request, page order then arrival order
    pub fn drain_pending(&mut self) -> Vec<Request> {
        self.pending_count = 0;
        std::mem::take(&mut self.pending)
            .into_values()
            .flatten()
            .collect()
    }
}

/// Checkers for every registered (array, tier)
#[derive(Debug, Default)]
pub struct OverlapCheckers {
    checkers: HashMap<(ArrayId, StorageTier), RangeOverlapChecker>,
}

impl OverlapCheckers {
    /// Register a range; replaces nothing if already present
    pub fn add(&mut self, array_id: ArrayId, tier: StorageTier, max_lpn: Lpn) -> bool {
        if self.checkers.contains_key(&(array_id, tier)) {
            return false;
        }
        self.checkers.insert(
            (array_id, tier),
            RangeOverlapChecker::new(array_id, tier, max_lpn),
        );
        true
    }

    pub fn remove(&mut self, array_id: ArrayId, tier: StorageTier) -> Option<RangeOverlapChecker> {
        self.checkers.remove(&(array_id, tier))
    }

    #[must_use]
    pub fn get(&self, array_id: ArrayId, tier: StorageTier) -> Option<&RangeOverlapChecker> {
        self.checkers.get(&(array_id, tier))
    }

    pub fn get_mut(
        &mut self,
        array_id: ArrayId,
        tier: StorageTier,
    ) -> Option<&mut RangeOverlapChecker> {
        self.checkers.get_mut(&(array_id, tier))
    }

    #[must_use]
    pub fn pending_total(&self) -> usize {
        self.checkers.values().map(RangeOverlapChecker::pending_total).sum()
    }

    pub fn drain_pending(&mut self) -> Vec<Request> {
        self.checkers
            .values_mut()
            .flat_map(RangeOverlapChecker::drain_pending)
            .collect()
    }
}
