//! The de-identification pipeline.
//!
//! Rows of an annotated genotype file are filtered by [`Criteria`], their variant and gene
//! identifiers are replaced by salted hashes, and both the rows and the sample columns are
//! shuffled before the result may leave the party that owns it.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    io::{self, BufRead, BufReader, Write},
    path::Path,
};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    bed::{BedFile, Chromosome, chromosome_name, parse_chromosome},
    crypto::hash,
    genotype::{Consequence, GenotypeError, GenotypeReader, GenotypeRow},
    utils::permutation::{gen_permute_pattern, permute, permute_copied},
};

/// Errors raised while extracting or reading back hashed data.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// The genotype input is invalid.
    #[error(transparent)]
    Genotype(#[from] GenotypeError),
    /// Not every row has the same number of samples.
    #[error("row of variant {variant} has {found} samples, expected {expected}")]
    InconsistentSamples {
        variant: String,
        expected: usize,
        found: usize,
    },
    /// A line of a hashed matrix or dictionary is malformed.
    #[error("line {line}: {reason}")]
    InvalidHashedLine { line: usize, reason: String },
    /// Reading or writing a file failed.
    #[error("extraction io error")]
    Io(#[from] io::Error),
}

/// Which rows may be part of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criteria {
    /// Maximum global allele frequency.
    pub max_af: f64,
    /// Maximum sub-population allele frequency.
    pub max_af_sub: f64,
    /// Least severe consequence that is still accepted.
    pub min_consequence: Consequence,
    /// Only keep single nucleotide variants.
    pub snv_only: bool,
    /// Regions covered by both parties, an empty set keeps every position. Shared regions
    /// are computed with [`BedFile::restrict`].
    pub bed: BedFile,
}

impl Criteria {
    /// Whether `row` passes the SNV, frequency, consequence and region filters.
    ///
    /// The frequency filter passes if *either* the global or the sub-population frequency is
    /// below its threshold.
    pub fn accepts(&self, row: &GenotypeRow) -> bool {
        if self.snv_only && !row.is_snv() {
            return false;
        }
        if !(row.af <= self.max_af || row.af_sub <= self.max_af_sub) {
            return false;
        }
        if !row.consequence.is_at_least(self.min_consequence) {
            return false;
        }
        let length = row.reference.len().max(1) as u64;
        self.bed.is_empty() || self.bed.overlap(row.chromosome, row.position, length)
    }
}

/// External quality control: decides which rows are excluded from the test.
pub trait QualityControl {
    /// Whether `row` fails quality control.
    fn excludes(&self, row: &GenotypeRow) -> bool;
}

/// Quality control that keeps every row.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoQualityControl;

impl QualityControl for NoQualityControl {
    fn excludes(&self, _row: &GenotypeRow) -> bool {
        false
    }
}

impl<F: Fn(&GenotypeRow) -> bool> QualityControl for F {
    fn excludes(&self, row: &GenotypeRow) -> bool {
        self(row)
    }
}

/// A row after de-identification: hashed identifiers and shuffled sample columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedRow {
    pub variant: String,
    pub gene: String,
    pub genotypes: Vec<i8>,
}

impl HashedRow {
    fn write_line(&self, out: &mut impl Write) -> io::Result<()> {
        write!(out, "{}\t{}\t", self.variant, self.gene)?;
        for (i, g) in self.genotypes.iter().enumerate() {
            if i > 0 {
                out.write_all(b",")?;
            }
            write!(out, "{g}")?;
        }
        out.write_all(b"\n")
    }
}

/// Maps gene hashes back to gene names, and genes to their first position.
///
/// Only the party holding the salt can build it, the Client uses it to de-hash results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashDictionary {
    genes: BTreeMap<String, String>,
    positions: BTreeMap<String, (Chromosome, u64)>,
}

impl HashDictionary {
    /// Records `gene` under `gene_hash`, and `(chr, pos)` if the gene has no position yet.
    pub fn insert(&mut self, gene_hash: &str, gene: &str, chr: Chromosome, pos: u64) {
        if !self.genes.contains_key(gene_hash) {
            self.genes.insert(gene_hash.to_string(), gene.to_string());
        }
        self.positions.entry(gene.to_string()).or_insert((chr, pos));
    }

    /// The gene whose hash is `gene_hash`.
    pub fn gene(&self, gene_hash: &str) -> Option<&str> {
        self.genes.get(gene_hash).map(String::as_str)
    }

    /// The first position seen for `gene`.
    pub fn position(&self, gene: &str) -> Option<(Chromosome, u64)> {
        self.positions.get(gene).copied()
    }

    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }

    /// `hash|gene` records.
    pub fn gene_records(&self) -> impl Iterator<Item = String> + '_ {
        self.genes.iter().map(|(hash, gene)| format!("{hash}|{gene}"))
    }

    /// `gene|chr:pos` records.
    pub fn position_records(&self) -> impl Iterator<Item = String> + '_ {
        self.positions
            .iter()
            .map(|(gene, (chr, pos))| format!("{gene}|{}:{pos}", chromosome_name(*chr)))
    }

    /// Parses one `hash|gene` record.
    pub fn add_gene_record(&mut self, record: &str) -> Result<(), String> {
        match record.split_once('|') {
            Some((hash, gene)) if !hash.is_empty() && !gene.is_empty() => {
                self.genes.insert(hash.to_string(), gene.to_string());
                Ok(())
            }
            _ => Err(format!("invalid hash record '{record}'")),
        }
    }

    /// Parses one `gene|chr:pos` record.
    pub fn add_position_record(&mut self, record: &str) -> Result<(), String> {
        let invalid = || format!("invalid position record '{record}'");
        let (gene, location) = record.split_once('|').ok_or_else(invalid)?;
        let (chr, pos) = location.split_once(':').ok_or_else(invalid)?;
        let chr = parse_chromosome(chr).map_err(|_| invalid())?;
        let pos = pos.parse().map_err(|_| invalid())?;
        self.positions.insert(gene.to_string(), (chr, pos));
        Ok(())
    }
}

/// Counters reported after an extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionStats {
    pub read: usize,
    pub filtered: usize,
    pub excluded: usize,
    pub kept: usize,
}

/// The de-identified data of one party.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    /// Hashed rows, already shuffled.
    pub rows: Vec<HashedRow>,
    /// Hashed ids of the variants that failed quality control.
    pub excluded: BTreeSet<String>,
    pub dictionary: HashDictionary,
    pub stats: ExtractionStats,
}

impl Extraction {
    /// Writes the hashed matrix, one `variantHash<TAB>geneHash<TAB>g1,g2,...` line per row.
    pub fn write_genotypes(&self, mut out: impl Write) -> io::Result<()> {
        for row in &self.rows {
            row.write_line(&mut out)?;
        }
        out.flush()
    }

    /// Writes the exclusion list, one hashed variant id per line.
    pub fn write_exclusions(&self, mut out: impl Write) -> io::Result<()> {
        for variant in &self.excluded {
            writeln!(out, "{variant}")?;
        }
        out.flush()
    }

    /// The hashed matrix as an in-memory blob.
    pub fn genotype_blob(&self) -> Vec<u8> {
        let mut out = vec![];
        // writing into a Vec never fails
        let _ = self.write_genotypes(&mut out);
        out
    }

    /// The exclusion list as an in-memory blob.
    pub fn exclusion_blob(&self) -> Vec<u8> {
        let mut out = vec![];
        let _ = self.write_exclusions(&mut out);
        out
    }
}

/// Filters, hashes and shuffles genotype rows.
pub struct Extractor<'a, Q = NoQualityControl> {
    criteria: &'a Criteria,
    salt: &'a str,
    qc: Q,
}

impl<'a> Extractor<'a> {
    /// An extractor without quality control.
    pub fn new(criteria: &'a Criteria, salt: &'a str) -> Self {
        Self {
            criteria,
            salt,
            qc: NoQualityControl,
        }
    }
}

impl<'a, Q: QualityControl> Extractor<'a, Q> {
    /// Uses `qc` to decide which rows are excluded.
    pub fn with_quality_control<Q2: QualityControl>(self, qc: Q2) -> Extractor<'a, Q2> {
        Extractor {
            criteria: self.criteria,
            salt: self.salt,
            qc,
        }
    }

    /// Extracts the annotated genotype file at `path`.
    pub fn extract_file(&self, path: &Path) -> Result<Extraction, ExtractError> {
        let reader = GenotypeReader::new(BufReader::new(File::open(path)?))?;
        self.extract(reader)
    }

    /// Extracts `rows`, shuffling with a freshly seeded generator.
    pub fn extract(
        &self,
        rows: impl IntoIterator<Item = Result<GenotypeRow, GenotypeError>>,
    ) -> Result<Extraction, ExtractError> {
        self.extract_with_seed(rows, rand::random())
    }

    /// Extracts `rows`, shuffling with a generator seeded by `seed`.
    pub fn extract_with_seed(
        &self,
        rows: impl IntoIterator<Item = Result<GenotypeRow, GenotypeError>>,
        seed: [u8; 32],
    ) -> Result<Extraction, ExtractError> {
        self.extract_with_rng(rows, &mut ChaCha20Rng::from_seed(seed))
    }

    fn extract_with_rng(
        &self,
        rows: impl IntoIterator<Item = Result<GenotypeRow, GenotypeError>>,
        rng: &mut impl Rng,
    ) -> Result<Extraction, ExtractError> {
        let mut out = Extraction::default();
        let mut samples = None;
        for row in rows {
            let row = row?;
            out.stats.read += 1;
            if !self.criteria.accepts(&row) {
                out.stats.filtered += 1;
                continue;
            }
            let expected = *samples.get_or_insert(row.genotypes.len());
            if row.genotypes.len() != expected {
                return Err(ExtractError::InconsistentSamples {
                    variant: row.variant_id(),
                    expected,
                    found: row.genotypes.len(),
                });
            }
            let variant = hash(self.salt, &row.variant_id());
            if self.qc.excludes(&row) {
                out.stats.excluded += 1;
                out.excluded.insert(variant);
                continue;
            }
            let gene = hash(self.salt, &row.gene);
            out.dictionary
                .insert(&gene, &row.gene, row.chromosome, row.position);
            out.rows.push(HashedRow {
                variant,
                gene,
                genotypes: row.genotypes,
            });
        }
        let columns = gen_permute_pattern(samples.unwrap_or(0), rng);
        for row in out.rows.iter_mut() {
            row.genotypes = permute_copied(&columns, &row.genotypes);
        }
        let order = gen_permute_pattern(out.rows.len(), rng);
        out.rows = permute(&order, out.rows);
        out.stats.kept = out.rows.len();
        debug!(stats = ?out.stats, "extraction finished");
        Ok(out)
    }
}

/// Parses a hashed matrix written by [`Extraction::write_genotypes`].
pub fn read_hashed_rows(reader: impl BufRead) -> Result<Vec<HashedRow>, ExtractError> {
    let mut rows = vec![];
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let invalid = |reason: &str| ExtractError::InvalidHashedLine {
            line: i + 1,
            reason: reason.to_string(),
        };
        let mut fields = line.split('\t');
        let (Some(variant), Some(gene), Some(genotypes), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(invalid("expected 3 columns"));
        };
        let genotypes = if genotypes.is_empty() {
            vec![]
        } else {
            genotypes
                .split(',')
                .map(|g| match g.parse::<i8>() {
                    Ok(g @ -1..=2) => Ok(g),
                    _ => Err(invalid("invalid genotype")),
                })
                .collect::<Result<_, _>>()?
        };
        rows.push(HashedRow {
            variant: variant.to_string(),
            gene: gene.to_string(),
            genotypes,
        });
    }
    Ok(rows)
}

/// Parses an exclusion list written by [`Extraction::write_exclusions`].
pub fn read_exclusions(reader: impl BufRead) -> Result<BTreeSet<String>, ExtractError> {
    let mut out = BTreeSet::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if !line.is_empty() {
            out.insert(line.to_string());
        }
    }
    Ok(out)
}
