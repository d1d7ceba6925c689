//! Address intersection engine.
//!
//! Narrows a candidate address set across an ordered list of event
//! selectors. The first step seeds the set from every participant inside the
//! time window; each later step keeps only the candidates that also took part
//! in that selector's events. Membership filters are issued in chunks of at
//! most [`MEMBERSHIP_CHUNK_SIZE`] addresses and unioned before the next step.

use anyhow::Result;
use async_trait::async_trait;
use cohort_core::{Address, EventSelector, TimeWindow, MEMBERSHIP_CHUNK_SIZE};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Read side of the event tables.
#[async_trait]
pub trait AddressSource: Send + Sync {
    /// Distinct participants of `selector` rows whose timestamp lies in
    /// `window`.
    ///
    /// With `members`, only rows with at least one participant in `members`
    /// match. Every participant of a matching row is returned, including a
    /// non-member counterparty of a two-sided row.
    async fn participants(
        &self,
        selector: EventSelector,
        window: TimeWindow,
        members: Option<&[Address]>,
    ) -> Result<HashSet<Address>>;
}

#[async_trait]
impl<T: AddressSource + ?Sized> AddressSource for Arc<T> {
    async fn participants(
        &self,
        selector: EventSelector,
        window: TimeWindow,
        members: Option<&[Address]>,
    ) -> Result<HashSet<Address>> {
        (**self).participants(selector, window, members).await
    }
}

/// Running candidate set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidates {
    /// No step has run; every address is still a candidate.
    Unconstrained,
    /// Explicit set, possibly empty.
    Set(BTreeSet<Address>),
}

impl Candidates {
    /// Number of candidates, `None` when unconstrained.
    pub fn len(&self) -> Option<usize> {
        match self {
            Candidates::Unconstrained => None,
            Candidates::Set(set) => Some(set.len()),
        }
    }

    /// Whether the set is constrained and empty.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Whether `address` is still a candidate.
    pub fn contains(&self, address: &Address) -> bool {
        match self {
            Candidates::Unconstrained => true,
            Candidates::Set(set) => set.contains(address),
        }
    }
}

/// One narrowing step and the candidate count it left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntersectionStep {
    /// Selector applied.
    pub selector: EventSelector,
    /// Candidate count after the step.
    pub size: usize,
}

/// Outcome of an intersection query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntersectionResult {
    /// Final candidate set.
    pub candidates: Candidates,
    /// Per-step reports, in input order.
    pub steps: Vec<IntersectionStep>,
}

impl IntersectionResult {
    /// Running candidate-set size after each step.
    pub fn sizes(&self) -> Vec<usize> {
        self.steps.iter().map(|step| step.size).collect()
    }
}

/// Progressive set narrowing over an [`AddressSource`].
#[derive(Debug, Clone)]
pub struct IntersectionEngine<S> {
    source: S,
    chunk_size: usize,
}

impl<S: AddressSource> IntersectionEngine<S> {
    /// Create an engine with the default chunk size.
    pub fn new(source: S) -> Self {
        Self {
            source,
            chunk_size: MEMBERSHIP_CHUNK_SIZE,
        }
    }

    /// Override the membership chunk size (minimum 1).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Run every selector in order over `window`.
    pub async fn run(
        &self,
        selectors: &[EventSelector],
        window: TimeWindow,
    ) -> Result<IntersectionResult> {
        let mut candidates = Candidates::Unconstrained;
        let mut steps = Vec::with_capacity(selectors.len());

        for &selector in selectors {
            let next = self.step(selector, window, &candidates).await?;
            debug!(%selector, size = next.len(), "Intersection step");

            steps.push(IntersectionStep {
                selector,
                size: next.len(),
            });
            candidates = Candidates::Set(next);
        }

        Ok(IntersectionResult { candidates, steps })
    }

    async fn step(
        &self,
        selector: EventSelector,
        window: TimeWindow,
        candidates: &Candidates,
    ) -> Result<BTreeSet<Address>> {
        let members = match candidates {
            Candidates::Unconstrained => {
                let found = self.source.participants(selector, window, None).await?;
                return Ok(found.into_iter().collect());
            }
            Candidates::Set(set) if set.is_empty() => return Ok(BTreeSet::new()),
            Candidates::Set(set) => set.iter().copied().collect::<Vec<_>>(),
        };

        let mut next = BTreeSet::new();
        for chunk in members.chunks(self.chunk_size) {
            let found = self
                .source
                .participants(selector, window, Some(chunk))
                .await?;

            // `members` is sorted, so each chunk is too.
            next.extend(
                found
                    .into_iter()
                    .filter(|address| chunk.binary_search(address).is_ok()),
            );
        }

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Row {
        selector: EventSelector,
        timestamp: i64,
        from: Address,
        to: Option<Address>,
    }

    #[derive(Default)]
    struct MemorySource {
        rows: Vec<Row>,
        chunk_sizes: Mutex<Vec<usize>>,
    }

    impl MemorySource {
        fn push(&mut self, selector: EventSelector, from: Address, to: Option<Address>) {
            self.rows.push(Row {
                selector,
                timestamp: 100,
                from,
                to,
            });
        }

        fn max_chunk(&self) -> usize {
            self.chunk_sizes
                .lock()
                .unwrap()
                .iter()
                .copied()
                .max()
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl AddressSource for MemorySource {
        async fn participants(
            &self,
            selector: EventSelector,
            window: TimeWindow,
            members: Option<&[Address]>,
        ) -> Result<HashSet<Address>> {
            if let Some(members) = members {
                self.chunk_sizes.lock().unwrap().push(members.len());
            }
            let members: Option<HashSet<&Address>> = members.map(|m| m.iter().collect());
            let is_member = |a: &Address| members.as_ref().map_or(true, |m| m.contains(a));

            Ok(self
                .rows
                .iter()
                .filter(|row| row.selector == selector && window.contains(row.timestamp))
                .filter(|row| is_member(&row.from) || row.to.as_ref().is_some_and(is_member))
                .flat_map(|row| std::iter::once(row.from).chain(row.to))
                .collect())
        }
    }

    fn addr(i: u64) -> Address {
        let mut bytes = [0u8; 20];
        bytes[12..].copy_from_slice(&i.to_be_bytes());
        Address::new(bytes)
    }

    fn window() -> TimeWindow {
        TimeWindow::new(0, 1_000).unwrap()
    }

    fn set(addresses: &[Address]) -> Candidates {
        Candidates::Set(addresses.iter().copied().collect())
    }

    #[tokio::test]
    async fn test_progressive_narrowing() {
        let (x, y, z, w) = (addr(1), addr(2), addr(3), addr(4));
        let a = EventSelector::AaveV2Deposit;
        let b = EventSelector::AaveV2Borrow;

        let mut source = MemorySource::default();
        for address in [x, y, z] {
            source.push(a, address, None);
        }
        for address in [y, z, w] {
            source.push(b, address, None);
        }
        let engine = IntersectionEngine::new(source);

        let result = engine.run(&[a, b], window()).await.unwrap();
        assert_eq!(result.candidates, set(&[y, z]));
        assert_eq!(result.sizes(), vec![3, 2]);

        let result = engine.run(&[a], window()).await.unwrap();
        assert_eq!(result.candidates, set(&[x, y, z]));
        assert_eq!(result.sizes(), vec![3]);

        let result = engine.run(&[], window()).await.unwrap();
        assert_eq!(result.candidates, Candidates::Unconstrained);
        assert_ne!(result.candidates, Candidates::Set(BTreeSet::new()));
        assert!(result.steps.is_empty());
    }

    #[tokio::test]
    async fn test_two_sided_step_keeps_only_members() {
        let (x, y, outsider) = (addr(1), addr(2), addr(99));
        let lido = EventSelector::LidoSubmission;
        let swap = EventSelector::UniswapV3Swap;

        let mut source = MemorySource::default();
        source.push(lido, x, None);
        source.push(lido, y, None);
        // x matches through `from`, y through `to`.
        source.push(swap, x, Some(outsider));
        source.push(swap, outsider, Some(y));

        let engine = IntersectionEngine::new(source);
        let result = engine.run(&[lido, swap], window()).await.unwrap();

        assert_eq!(result.candidates, set(&[x, y]));
        assert!(!result.candidates.contains(&outsider));
    }

    #[tokio::test]
    async fn test_empty_candidates_short_circuit() {
        let lido = EventSelector::LidoSubmission;
        let repay = EventSelector::AaveV2Repay;

        let mut source = MemorySource::default();
        source.push(repay, addr(1), None);

        let engine = IntersectionEngine::new(source);
        let result = engine.run(&[lido, repay], window()).await.unwrap();

        assert!(result.candidates.is_empty());
        assert_eq!(result.sizes(), vec![0, 0]);
        // No membership query was issued for the empty set.
        assert_eq!(engine.source.max_chunk(), 0);
    }

    #[tokio::test]
    async fn test_time_window_filters_rows() {
        let lido = EventSelector::LidoSubmission;
        let mut source = MemorySource::default();
        source.push(lido, addr(1), None);

        let engine = IntersectionEngine::new(source);
        let outside = TimeWindow::new(101, 200).unwrap();
        let result = engine.run(&[lido], outside).await.unwrap();

        assert!(result.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_chunked_membership_matches_unchunked() {
        let seed = EventSelector::AaveV2Deposit;
        let filter = EventSelector::AaveV2Withdraw;

        let mut source = MemorySource::default();
        for i in 0..25_000 {
            source.push(seed, addr(i), None);
            if i % 3 == 0 {
                source.push(filter, addr(i), None);
            }
        }
        let source = Arc::new(source);

        let chunked = IntersectionEngine::new(Arc::clone(&source));
        let chunked_result = chunked.run(&[seed, filter], window()).await.unwrap();
        assert!(source.max_chunk() <= MEMBERSHIP_CHUNK_SIZE);
        assert_eq!(source.chunk_sizes.lock().unwrap().len(), 3);

        let reference = IntersectionEngine::new(Arc::clone(&source)).with_chunk_size(usize::MAX);
        let reference_result = reference.run(&[seed, filter], window()).await.unwrap();

        assert_eq!(chunked_result.candidates, reference_result.candidates);
        assert_eq!(chunked_result.sizes(), vec![25_000, 8_334]);
    }
}
