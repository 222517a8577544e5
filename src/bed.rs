//! Genomic interval sets ("bed" regions) used to restrict what may leave a party.
//!
//! A [`BedRegion`] is the half-open interval `]start, end]`: `start` is 0-based, `end` is
//! 1-based, so the region covers the 1-based positions `start + 1 ..= end`. A [`BedFile`]
//! keeps, per chromosome, a list of regions sorted by start and pairwise non-overlapping.

use std::{
    cmp::{max, min},
    collections::BTreeMap,
    fmt,
    io::BufRead,
    str::FromStr,
};

use serde::{Deserialize, Serialize};

/// Errors raised while building or parsing regions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BedError {
    /// `start >= end`, usually a sign that 0-based and 1-based coordinates got mixed.
    #[error("invalid region ]{start}, {end}]: start must be lower than end")]
    EmptyRegion { start: u64, end: u64 },
    /// The chromosome name is not one of `1..22, X, Y, MT`.
    #[error("unknown chromosome '{0}'")]
    UnknownChromosome(String),
    /// A line of a bed file could not be parsed.
    #[error("line {line}: {reason}")]
    InvalidLine { line: usize, reason: String },
    /// The compact text form could not be parsed.
    #[error("invalid region list '{0}'")]
    InvalidCompact(String),
}

/// Chromosomes are numbered `1..=22`, with `X = 23`, `Y = 24` and `MT = 25`.
pub type Chromosome = u8;

/// Parses a chromosome name, with or without `chr` prefix.
pub fn parse_chromosome(name: &str) -> Result<Chromosome, BedError> {
    let bare = name
        .strip_prefix("chr")
        .or_else(|| name.strip_prefix("CHR"))
        .unwrap_or(name);
    let chr = match bare {
        "X" | "x" => 23,
        "Y" | "y" => 24,
        "M" | "MT" | "m" | "mt" => 25,
        n => match n.parse::<u8>() {
            Ok(n @ 1..=25) => n,
            _ => return Err(BedError::UnknownChromosome(name.to_string())),
        },
    };
    Ok(chr)
}

/// The canonical name of a chromosome number.
pub fn chromosome_name(chr: Chromosome) -> String {
    match chr {
        23 => "X".to_string(),
        24 => "Y".to_string(),
        25 => "MT".to_string(),
        n => n.to_string(),
    }
}

/// The interval `]start, end]` on one chromosome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BedRegion {
    start: u64,
    end: u64,
}

impl BedRegion {
    /// Creates a region, rejecting `start >= end`.
    pub fn new(start: u64, end: u64) -> Result<Self, BedError> {
        if start >= end {
            return Err(BedError::EmptyRegion { start, end });
        }
        Ok(Self { start, end })
    }

    /// The 0-based start (exclusive when seen as 1-based positions).
    pub fn start(&self) -> u64 {
        self.start
    }

    /// The 1-based end (inclusive).
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of positions covered.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Always `false`, regions are never empty.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether the 1-based position `pos` lies in `]start, end]`.
    pub fn contains(&self, pos: u64) -> bool {
        self.start < pos && pos <= self.end
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }
}

/// Sorted, merged interval sets per chromosome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct BedFile {
    regions: BTreeMap<Chromosome, Vec<BedRegion>>,
}

impl BedFile {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no region is present at all.
    pub fn is_empty(&self) -> bool {
        self.regions.values().all(Vec::is_empty)
    }

    /// Chromosomes with at least one region, in ascending order.
    pub fn chromosomes(&self) -> impl Iterator<Item = Chromosome> + '_ {
        self.regions
            .iter()
            .filter(|(_, r)| !r.is_empty())
            .map(|(chr, _)| *chr)
    }

    /// The sorted regions of one chromosome.
    pub fn regions(&self, chr: Chromosome) -> &[BedRegion] {
        self.regions.get(&chr).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of regions over all chromosomes.
    pub fn region_count(&self) -> usize {
        self.regions.values().map(Vec::len).sum()
    }

    /// Number of positions covered over all chromosomes.
    pub fn covered_positions(&self) -> u64 {
        self.regions.values().flatten().map(BedRegion::len).sum()
    }

    /// Inserts a region, merging it with every region it overlaps or touches.
    ///
    /// The insertion point is found by binary search; input that is already (nearly) sorted
    /// only shifts a few elements.
    pub fn add(&mut self, chr: Chromosome, region: BedRegion) {
        let list = self.regions.entry(chr).or_default();
        let mut idx = list.partition_point(|r| r.start < region.start);
        list.insert(idx, region);
        if idx > 0 && list[idx - 1].end >= list[idx].start {
            list[idx - 1].end = max(list[idx - 1].end, list[idx].end);
            list.remove(idx);
            idx -= 1;
        }
        while idx + 1 < list.len() && list[idx + 1].start <= list[idx].end {
            list[idx].end = max(list[idx].end, list[idx + 1].end);
            list.remove(idx + 1);
        }
    }

    /// Whether any of the `length` positions starting at the 1-based `pos` is covered.
    ///
    /// Only the last region starting at or before `pos - 1` and its successor can intersect
    /// the queried interval, because regions are sorted and disjoint.
    pub fn overlap(&self, chr: Chromosome, pos: u64, length: u64) -> bool {
        let list = self.regions(chr);
        if list.is_empty() || length == 0 || pos == 0 {
            return false;
        }
        let (start, end) = (pos - 1, (pos - 1).saturating_add(length));
        let idx = list.partition_point(|r| r.start <= start);
        if idx > 0 && list[idx - 1].overlaps(start, end) {
            return true;
        }
        list.get(idx).is_some_and(|r| r.overlaps(start, end))
    }

    /// Whether the 1-based position `pos` is covered.
    pub fn contains(&self, chr: Chromosome, pos: u64) -> bool {
        self.overlap(chr, pos, 1)
    }

    /// The regions two parties may share, an empty set meaning no restriction.
    ///
    /// `None` when both parties declared regions but none of them overlap: the empty
    /// intersection would otherwise lift the restriction of both.
    pub fn restrict(&self, other: &BedFile) -> Option<BedFile> {
        let shared = self.intersection(other);
        if shared.is_empty() && !self.is_empty() && !other.is_empty() {
            return None;
        }
        Some(shared)
    }

    /// The positions covered by both sets. An empty operand yields a copy of the other one.
    pub fn intersection(&self, other: &BedFile) -> BedFile {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }
        let mut out = BedFile::new();
        for (chr, a_list) in &self.regions {
            let b_list = other.regions(*chr);
            let mut i_start = 0;
            for a in a_list {
                // regions of B ending before `a` can not intersect any later region of A
                while i_start < b_list.len() && b_list[i_start].end <= a.start {
                    i_start += 1;
                }
                let mut i_end = i_start;
                while i_end < b_list.len() && b_list[i_end].start < a.end {
                    let b = b_list[i_end];
                    let (start, end) = (max(a.start, b.start), min(a.end, b.end));
                    if start < end {
                        out.add(*chr, BedRegion { start, end });
                    }
                    i_end += 1;
                }
            }
        }
        out
    }

    /// The positions covered by at least one of the sets.
    pub fn union(&self, other: &BedFile) -> BedFile {
        let mut out = BedFile::new();
        for (chr, list) in self.regions.iter().chain(other.regions.iter()) {
            for region in list {
                out.add(*chr, *region);
            }
        }
        out
    }

    /// Reads a bed file: `chrom<TAB>start<TAB>end[...]` lines, `#`, `track` and `browser`
    /// lines are skipped.
    pub fn read(reader: impl BufRead) -> Result<BedFile, BedError> {
        let mut out = BedFile::new();
        for (i, line) in reader.lines().enumerate() {
            let line_no = i + 1;
            let line = line.map_err(|err| BedError::InvalidLine {
                line: line_no,
                reason: err.to_string(),
            })?;
            let line = line.trim();
            if line.is_empty()
                || line.starts_with('#')
                || line.starts_with("track")
                || line.starts_with("browser")
            {
                continue;
            }
            let invalid = |reason: String| BedError::InvalidLine {
                line: line_no,
                reason,
            };
            let mut fields = line.split('\t');
            let (Some(chr), Some(start), Some(end)) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(invalid("expected chrom, start and end".to_string()));
            };
            let chr = parse_chromosome(chr).map_err(|err| invalid(err.to_string()))?;
            let start = start
                .parse()
                .map_err(|_| invalid(format!("invalid start '{start}'")))?;
            let end = end
                .parse()
                .map_err(|_| invalid(format!("invalid end '{end}'")))?;
            let region = BedRegion::new(start, end).map_err(|err| invalid(err.to_string()))?;
            out.add(chr, region);
        }
        Ok(out)
    }
}

/// Compact form `chr:start-end,start-end;chr:...`, the empty set is the empty string.
impl fmt::Display for BedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first_chr = true;
        for chr in self.chromosomes() {
            if !first_chr {
                f.write_str(";")?;
            }
            first_chr = false;
            write!(f, "{}:", chromosome_name(chr))?;
            for (i, r) in self.regions(chr).iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{}-{}", r.start, r.end)?;
            }
        }
        Ok(())
    }
}

impl FromStr for BedFile {
    type Err = BedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = BedFile::new();
        let invalid = || BedError::InvalidCompact(s.to_string());
        for chr_part in s.trim().split(';').filter(|p| !p.is_empty()) {
            let (chr, list) = chr_part.split_once(':').ok_or_else(invalid)?;
            let chr = parse_chromosome(chr)?;
            for range in list.split(',') {
                let (start, end) = range.split_once('-').ok_or_else(invalid)?;
                let start = start.parse().map_err(|_| invalid())?;
                let end = end.parse().map_err(|_| invalid())?;
                out.add(chr, BedRegion::new(start, end)?);
            }
        }
        Ok(out)
    }
}

impl From<BedFile> for String {
    fn from(bed: BedFile) -> Self {
        bed.to_string()
    }
}

impl TryFrom<String> for BedFile {
    type Error = BedError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn bed(regions: &[(Chromosome, u64, u64)]) -> BedFile {
        let mut bed = BedFile::new();
        for &(chr, start, end) in regions {
            bed.add(chr, BedRegion::new(start, end).unwrap());
        }
        bed
    }

    fn arbitrary_bed() -> impl Strategy<Value = BedFile> {
        prop::collection::vec((1u8..4, 0u64..2_000, 1u64..200), 0..40).prop_map(|regions| {
            let mut bed = BedFile::new();
            for (chr, start, len) in regions {
                bed.add(chr, BedRegion::new(start, start + len).unwrap());
            }
            bed
        })
    }

    fn assert_canonical(bed: &BedFile) {
        for chr in bed.chromosomes() {
            for w in bed.regions(chr).windows(2) {
                assert!(w[0].end < w[1].start, "{w:?} overlap or touch");
            }
        }
    }

    #[test]
    fn start_equal_end_is_rejected() {
        assert_eq!(
            BedRegion::new(10, 10),
            Err(BedError::EmptyRegion { start: 10, end: 10 })
        );
        assert!(BedRegion::new(11, 10).is_err());
    }

    #[test]
    fn half_open_semantics() {
        let r = BedRegion::new(99, 200).unwrap();
        assert!(!r.contains(99));
        assert!(r.contains(100));
        assert!(r.contains(200));
        assert!(!r.contains(201));
    }

    #[test]
    fn add_merges_neighbours() {
        let b = bed(&[(1, 50, 60), (1, 10, 20), (1, 30, 40), (1, 15, 35), (1, 40, 45)]);
        assert_eq!(b.to_string(), "1:10-45,50-60");
        let b = bed(&[(1, 10, 20), (1, 30, 40), (1, 50, 60), (1, 0, 100)]);
        assert_eq!(b.regions(1), &[BedRegion::new(0, 100).unwrap()]);
    }

    #[test]
    fn overlap_checks_both_candidates() {
        let b = bed(&[(1, 100, 200), (1, 300, 400)]);
        assert!(b.overlap(1, 101, 1));
        assert!(!b.overlap(1, 100, 1));
        assert!(b.overlap(1, 95, 10));
        assert!(!b.overlap(1, 201, 99));
        assert!(!b.overlap(1, 201, 100));
        assert!(b.overlap(1, 201, 101));
        assert!(b.overlap(1, 400, 5));
        assert!(!b.overlap(1, 401, 5));
        assert!(!b.overlap(2, 150, 1));
    }

    #[test]
    fn overlap_near_the_end_of_the_coordinate_space() {
        let b = bed(&[(1, u64::MAX - 10, u64::MAX)]);
        assert!(b.overlap(1, u64::MAX, 2));
        assert!(b.overlap(1, u64::MAX - 5, u64::MAX));
        assert!(!b.overlap(1, 1, 1));
        assert!(!bed(&[(1, 100, 200)]).overlap(1, u64::MAX, u64::MAX));
    }

    #[test]
    fn intersection_with_empty_is_copy() {
        let a = bed(&[(1, 10, 20), (23, 5, 9)]);
        assert_eq!(a.intersection(&BedFile::new()), a);
        assert_eq!(BedFile::new().intersection(&a), a);
    }

    #[test]
    fn restrict_refuses_disjoint_declarations() {
        let client = bed(&[(1, 900, 1100)]);
        let rpp = bed(&[(2, 0, 100)]);
        assert_eq!(client.restrict(&rpp), None);
        assert_eq!(rpp.restrict(&client), None);
        assert_eq!(client.restrict(&BedFile::new()), Some(client.clone()));
        assert_eq!(BedFile::new().restrict(&BedFile::new()), Some(BedFile::new()));
        let panel = bed(&[(1, 1000, 5000), (2, 0, 100)]);
        assert_eq!(client.restrict(&panel).unwrap().to_string(), "1:1000-1100");
    }

    #[test]
    fn intersection_spanning_several_regions() {
        let a = bed(&[(1, 0, 100), (2, 0, 10)]);
        let b = bed(&[(1, 10, 20), (1, 30, 40), (1, 90, 150), (3, 0, 10)]);
        assert_eq!(a.intersection(&b).to_string(), "1:10-20,30-40,90-100");
    }

    #[test]
    fn compact_form_round_trip_and_errors() {
        let b = bed(&[(1, 10, 20), (1, 30, 40), (23, 0, 5)]);
        let text = b.to_string();
        assert_eq!(text, "1:10-20,30-40;X:0-5");
        assert_eq!(text.parse::<BedFile>().unwrap(), b);
        assert_eq!("".parse::<BedFile>().unwrap(), BedFile::new());
        assert!("1:20-10".parse::<BedFile>().is_err());
        assert!("1:20".parse::<BedFile>().is_err());
        assert!("Z:1-2".parse::<BedFile>().is_err());
    }

    #[test]
    fn read_bed_file() {
        let text = "track name=covered\n#comment\nchr1\t10\t20\tname\nchrX\t0\t5\n1\t15\t30\n";
        let b = BedFile::read(text.as_bytes()).unwrap();
        assert_eq!(b.to_string(), "1:10-30;X:0-5");

        let err = BedFile::read("chr1\t10\t10\n".as_bytes()).unwrap_err();
        assert!(matches!(err, BedError::InvalidLine { line: 1, .. }));
        assert!(BedFile::read("chr1\tten\t20\n".as_bytes()).is_err());
    }

    #[test]
    fn chromosome_names() {
        assert_eq!(parse_chromosome("chr7"), Ok(7));
        assert_eq!(parse_chromosome("X"), Ok(23));
        assert_eq!(parse_chromosome("chrMT"), Ok(25));
        assert!(parse_chromosome("chr0").is_err());
        assert_eq!(chromosome_name(24), "Y");
    }

    proptest! {
        #[test]
        fn regions_contain_their_first_position(b in arbitrary_bed()) {
            for chr in b.chromosomes() {
                for r in b.regions(chr) {
                    prop_assert!(b.contains(chr, r.start() + 1));
                    prop_assert!(!b.contains(chr, r.start()) || r.start() == 0);
                }
            }
        }

        #[test]
        fn produced_sets_are_canonical(a in arbitrary_bed(), b in arbitrary_bed()) {
            assert_canonical(&a);
            assert_canonical(&a.union(&b));
            assert_canonical(&a.intersection(&b));
        }

        #[test]
        fn intersection_is_commutative_subset(a in arbitrary_bed(), b in arbitrary_bed()) {
            let ab = a.intersection(&b);
            prop_assert_eq!(&ab, &b.intersection(&a));
            if !a.is_empty() && !b.is_empty() {
                for chr in ab.chromosomes() {
                    for r in ab.regions(chr) {
                        prop_assert!(a.overlap(chr, r.start() + 1, r.len()));
                        prop_assert!(b.overlap(chr, r.start() + 1, r.len()));
                        for pos in [r.start() + 1, r.end()] {
                            prop_assert!(a.contains(chr, pos) && b.contains(chr, pos));
                        }
                    }
                }
            }
        }

        #[test]
        fn union_with_empty_is_identity(a in arbitrary_bed()) {
            prop_assert_eq!(a.union(&BedFile::new()), a.clone());
            prop_assert_eq!(BedFile::new().union(&a), a);
        }
    }
}
