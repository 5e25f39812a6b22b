use super::error::CoverageError;
use super::range::Range;

/// An ordered set of non-overlapping ranges inside a fixed domain.
///
/// Invariants: ranges are sorted by start, pairwise disjoint and
/// non-adjoining, and each is contained in the domain. Empty ranges are
/// never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Covering {
    domain: Range,
    ranges: Vec<Range>,
}

impl Covering {
    /// Creates an empty covering over the given domain.
    pub fn new(domain: Range) -> Self {
        Self {
            domain,
            ranges: Vec::new(),
        }
    }

    pub fn domain(&self) -> Range {
        self.domain
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    /// Returns true if every byte of the domain is covered.
    pub fn is_complete(&self) -> bool {
        self.ranges.len() == 1 && self.ranges[0] == self.domain
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of covered bytes.
    pub fn covered_len(&self) -> u64 {
        self.ranges.iter().map(Range::len).sum()
    }

    /// Returns true if every byte of `r` is covered.
    pub fn covers(&self, r: &Range) -> bool {
        if r.is_empty() {
            return true;
        }
        self.ranges.iter().any(|x| x.contains(r))
    }

    /// Returns a covering that also includes `r`, merging with any range
    /// it overlaps or adjoins.
    pub fn fill(&self, r: Range) -> Result<Covering, CoverageError> {
        self.check_domain(&r)?;
        if r.is_empty() {
            return Ok(self.clone());
        }

        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        let mut merged = r;
        let mut placed = false;

        for x in &self.ranges {
            if x.last() < merged.first() {
                out.push(*x);
            } else if x.first() > merged.last() {
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push(*x);
            } else {
                merged = merged.merge(x);
            }
        }
        if !placed {
            out.push(merged);
        }

        Ok(Covering {
            domain: self.domain,
            ranges: out,
        })
    }

    /// Returns a covering with every byte of `r` removed.
    pub fn poke(&self, r: Range) -> Result<Covering, CoverageError> {
        self.check_domain(&r)?;
        if r.is_empty() {
            return Ok(self.clone());
        }

        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        for x in &self.ranges {
            if !x.intersects(&r) {
                out.push(*x);
                continue;
            }
            if x.first() < r.first() {
                out.push(Range::new(x.first(), r.first()));
            }
            if r.last() < x.last() {
                out.push(Range::new(r.last(), x.last()));
            }
        }

        Ok(Covering {
            domain: self.domain,
            ranges: out,
        })
    }

    /// Returns the leftmost sub-range of `sub` disjoint from the covering,
    /// or `None` if `sub` is fully covered.
    pub fn first_gap(&self, sub: Range) -> Result<Option<Range>, CoverageError> {
        self.check_domain(&sub)?;

        let mut cursor = sub.first();
        for x in &self.ranges {
            if x.last() <= cursor {
                continue;
            }
            if x.first() >= sub.last() {
                break;
            }
            if x.first() > cursor {
                return Ok(Some(Range::new(cursor, x.first().min(sub.last()))));
            }
            cursor = x.last();
            if cursor >= sub.last() {
                return Ok(None);
            }
        }

        if cursor < sub.last() {
            Ok(Some(Range::new(cursor, sub.last())))
        } else {
            Ok(None)
        }
    }

    /// Collects every uncovered sub-range of `sub`, in ascending order.
    pub fn gaps(&self, sub: Range) -> Result<Vec<Range>, CoverageError> {
        self.check_domain(&sub)?;

        let mut out = Vec::new();
        let mut cursor = sub.first();
        for x in &self.ranges {
            if x.last() <= cursor {
                continue;
            }
            if x.first() >= sub.last() {
                break;
            }
            if x.first() > cursor {
                out.push(Range::new(cursor, x.first()));
            }
            cursor = x.last().min(sub.last());
        }
        if cursor < sub.last() {
            out.push(Range::new(cursor, sub.last()));
        }
        Ok(out)
    }

    fn check_domain(&self, r: &Range) -> Result<(), CoverageError> {
        if self.domain.contains(r) {
            Ok(())
        } else {
            Err(CoverageError::OutOfDomain {
                range: *r,
                domain: self.domain,
            })
        }
    }
}
