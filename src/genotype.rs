//! Annotated genotype rows, the input of the de-identification pipeline.
//!
//! The annotated genotype file is tab-separated:
//!
//! ```text
//! #CHROM  POS   ID   REF  ALT  GENE   CONSEQUENCE       AF     AF_SUB  SAMPLE_1,SAMPLE_2,...
//! chr1    1000  .    A    G    GENE1  missense_variant  0.001  0.0005  0,1,2,-1
//! ```
//!
//! The optional `#CHROM` header names the samples in its last column. Other `#` lines are
//! comments. Genotypes are allele copy numbers, `-1` marks a missing call.

use std::{fmt, io::BufRead, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::bed::{Chromosome, chromosome_name, parse_chromosome};

/// Errors raised while reading genotype rows.
#[derive(Debug, thiserror::Error)]
pub enum GenotypeError {
    /// A line could not be parsed.
    #[error("line {line}: {reason}")]
    InvalidLine { line: usize, reason: String },
    /// The underlying reader failed.
    #[error("unable to read genotypes")]
    Io(#[from] std::io::Error),
}

/// VEP consequences, from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Consequence {
    TranscriptAblation,
    SpliceAcceptorVariant,
    SpliceDonorVariant,
    StopGained,
    FrameshiftVariant,
    StopLost,
    StartLost,
    InframeInsertion,
    InframeDeletion,
    MissenseVariant,
    ProteinAlteringVariant,
    SpliceRegionVariant,
    SynonymousVariant,
    IntronVariant,
    UpstreamGeneVariant,
    DownstreamGeneVariant,
    IntergenicVariant,
}

const CONSEQUENCE_NAMES: [(Consequence, &str); 17] = [
    (Consequence::TranscriptAblation, "transcript_ablation"),
    (Consequence::SpliceAcceptorVariant, "splice_acceptor_variant"),
    (Consequence::SpliceDonorVariant, "splice_donor_variant"),
    (Consequence::StopGained, "stop_gained"),
    (Consequence::FrameshiftVariant, "frameshift_variant"),
    (Consequence::StopLost, "stop_lost"),
    (Consequence::StartLost, "start_lost"),
    (Consequence::InframeInsertion, "inframe_insertion"),
    (Consequence::InframeDeletion, "inframe_deletion"),
    (Consequence::MissenseVariant, "missense_variant"),
    (Consequence::ProteinAlteringVariant, "protein_altering_variant"),
    (Consequence::SpliceRegionVariant, "splice_region_variant"),
    (Consequence::SynonymousVariant, "synonymous_variant"),
    (Consequence::IntronVariant, "intron_variant"),
    (Consequence::UpstreamGeneVariant, "upstream_gene_variant"),
    (Consequence::DownstreamGeneVariant, "downstream_gene_variant"),
    (Consequence::IntergenicVariant, "intergenic_variant"),
];

impl Consequence {
    /// Rank on the severity ladder, 0 is the most severe.
    pub fn rank(self) -> usize {
        self as usize
    }

    /// Whether `self` is at least as severe as `threshold`.
    pub fn is_at_least(self, threshold: Consequence) -> bool {
        self.rank() <= threshold.rank()
    }

    /// The VEP term.
    pub fn as_str(self) -> &'static str {
        CONSEQUENCE_NAMES[self.rank()].1
    }
}

impl fmt::Display for Consequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Consequence {
    type Err = String;

    /// Parses a VEP term; `&`-joined terms resolve to the most severe one.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut most: Option<Consequence> = None;
        for term in s.split('&') {
            let c = CONSEQUENCE_NAMES
                .iter()
                .find(|(_, name)| *name == term.trim())
                .map(|(c, _)| *c)
                .ok_or_else(|| format!("unknown consequence '{term}'"))?;
            most = Some(most.map_or(c, |m| m.min(c)));
        }
        most.ok_or_else(|| "empty consequence".to_string())
    }
}

/// One (variant, gene) pair with its annotations and per-sample genotype calls.
#[derive(Debug, Clone, PartialEq)]
pub struct GenotypeRow {
    pub chromosome: Chromosome,
    pub position: u64,
    pub reference: String,
    pub alternate: String,
    pub gene: String,
    pub consequence: Consequence,
    /// Global population allele frequency.
    pub af: f64,
    /// Sub-population allele frequency.
    pub af_sub: f64,
    pub genotypes: Vec<i8>,
}

impl GenotypeRow {
    /// The identifier hashed before the row leaves its owner: `chr:pos:ref:alt`.
    pub fn variant_id(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            chromosome_name(self.chromosome),
            self.position,
            self.reference,
            self.alternate
        )
    }

    /// Single nucleotide variant: one base replaced by one other base.
    pub fn is_snv(&self) -> bool {
        let is_base = |s: &str| matches!(s, "A" | "C" | "G" | "T");
        is_base(&self.reference) && is_base(&self.alternate) && self.reference != self.alternate
    }
}

/// Streams [`GenotypeRow`]s from an annotated genotype file.
pub struct GenotypeReader<R> {
    lines: std::io::Lines<R>,
    line_no: usize,
    samples: Vec<String>,
    pending: Option<String>,
}

impl<R: BufRead> GenotypeReader<R> {
    /// Creates a reader, consuming comment lines and the optional sample header.
    pub fn new(reader: R) -> Result<Self, GenotypeError> {
        let mut lines = reader.lines();
        let mut line_no = 0;
        let mut samples = vec![];
        let mut pending = None;
        for line in lines.by_ref() {
            let line = line?;
            line_no += 1;
            if let Some(header) = line.strip_prefix("#CHROM") {
                samples = header
                    .split('\t')
                    .nth(9)
                    .map(|s| s.split(',').map(str::to_string).collect())
                    .unwrap_or_default();
            } else if line.starts_with('#') || line.trim().is_empty() {
                continue;
            } else {
                pending = Some(line);
                break;
            }
        }
        Ok(Self {
            lines,
            line_no,
            samples,
            pending,
        })
    }

    /// Sample names from the header, empty if the file has none.
    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    fn parse(&self, line: &str) -> Result<GenotypeRow, GenotypeError> {
        let invalid = |reason: String| GenotypeError::InvalidLine {
            line: self.line_no,
            reason,
        };
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 10 {
            return Err(invalid(format!("expected 10 columns, got {}", fields.len())));
        }
        let chromosome = parse_chromosome(fields[0]).map_err(|err| invalid(err.to_string()))?;
        let position = match fields[1].parse::<u64>() {
            Ok(pos) if pos > 0 => pos,
            _ => return Err(invalid(format!("invalid position '{}'", fields[1]))),
        };
        let consequence = fields[6].parse().map_err(invalid)?;
        let frequency = |s: &str| -> Result<f64, GenotypeError> {
            if s == "." || s.is_empty() {
                return Ok(0.0);
            }
            match s.parse::<f64>() {
                Ok(f) if (0.0..=1.0).contains(&f) => Ok(f),
                _ => Err(invalid(format!("invalid allele frequency '{s}'"))),
            }
        };
        let af = frequency(fields[7])?;
        let af_sub = frequency(fields[8])?;
        let genotypes = fields[9]
            .split(',')
            .map(|g| match g.trim() {
                "-1" | "." => Ok(-1),
                "0" => Ok(0),
                "1" => Ok(1),
                "2" => Ok(2),
                other => Err(invalid(format!("invalid genotype '{other}'"))),
            })
            .collect::<Result<Vec<i8>, _>>()?;
        if !self.samples.is_empty() && genotypes.len() != self.samples.len() {
            return Err(invalid(format!(
                "{} genotypes for {} samples",
                genotypes.len(),
                self.samples.len()
            )));
        }
        Ok(GenotypeRow {
            chromosome,
            position,
            reference: fields[3].to_string(),
            alternate: fields[4].to_string(),
            gene: fields[5].to_string(),
            consequence,
            af,
            af_sub,
            genotypes,
        })
    }
}

impl<R: BufRead> Iterator for GenotypeReader<R> {
    type Item = Result<GenotypeRow, GenotypeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(line) = self.pending.take() {
            return Some(self.parse(&line));
        }
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => return Some(Err(err.into())),
            };
            self.line_no += 1;
            if line.starts_with('#') || line.trim().is_empty() {
                continue;
            }
            return Some(self.parse(&line));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = "\
##source=test
#CHROM\tPOS\tID\tREF\tALT\tGENE\tCONSEQUENCE\tAF\tAF_SUB\tS1,S2,S3
chr1\t1000\t.\tA\tG\tGENE1\tmissense_variant\t0.001\t.\t0,1,2

chr2\t2000\trs1\tAT\tA\tGENE2\tsynonymous_variant&stop_gained\t0.2\t0.01\t-1,0,1
";

    #[test]
    fn reads_rows_and_samples() {
        let reader = GenotypeReader::new(FILE.as_bytes()).unwrap();
        assert_eq!(reader.samples(), &["S1", "S2", "S3"]);
        let rows: Vec<_> = reader.collect::<Result<_, _>>().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].variant_id(), "1:1000:A:G");
        assert!(rows[0].is_snv());
        assert_eq!(rows[0].af_sub, 0.0);
        assert_eq!(rows[1].consequence, Consequence::StopGained);
        assert!(!rows[1].is_snv());
        assert_eq!(rows[1].genotypes, vec![-1, 0, 1]);
    }

    #[test]
    fn reports_line_numbers() {
        let file = "chr1\t1000\t.\tA\tG\tG1\tmissense_variant\t0.1\t0.1\t0,1\nchr1\t1001\t.\tA\tG\tG1\tmissense_variant\t1.5\t0.1\t0,1\n";
        let mut reader = GenotypeReader::new(file.as_bytes()).unwrap();
        assert!(reader.next().unwrap().is_ok());
        let err = reader.next().unwrap().unwrap_err();
        assert!(matches!(err, GenotypeError::InvalidLine { line: 2, .. }), "{err}");
    }

    #[test]
    fn sample_count_must_match_header() {
        let file = "#CHROM\tPOS\tID\tREF\tALT\tGENE\tCONSEQUENCE\tAF\tAF_SUB\tS1,S2\nchr1\t1\t.\tA\tG\tG1\tmissense_variant\t0\t0\t0\n";
        let mut reader = GenotypeReader::new(file.as_bytes()).unwrap();
        assert!(reader.next().unwrap().is_err());
    }

    #[test]
    fn consequence_ladder() {
        assert!(Consequence::StopGained.is_at_least(Consequence::MissenseVariant));
        assert!(Consequence::MissenseVariant.is_at_least(Consequence::MissenseVariant));
        assert!(!Consequence::SynonymousVariant.is_at_least(Consequence::MissenseVariant));
        for (c, name) in CONSEQUENCE_NAMES {
            assert_eq!(name.parse::<Consequence>(), Ok(c));
            assert_eq!(c.to_string(), name);
        }
        assert!("not_a_consequence".parse::<Consequence>().is_err());
    }

    #[test]
    fn joined_consequences_resolve_to_most_severe() {
        assert_eq!(
            "intron_variant&missense_variant&synonymous_variant".parse(),
            Ok(Consequence::MissenseVariant)
        );
        assert!("missense_variant&bogus".parse::<Consequence>().is_err());
        assert!("".parse::<Consequence>().is_err());
    }

    #[test]
    fn positions_must_be_one_based() {
        for pos in ["0", "-5", "18446744073709551616"] {
            let file = format!("chr1\t{pos}\t.\tA\tG\tG1\tmissense_variant\t0\t0\t0\n");
            let mut reader = GenotypeReader::new(file.as_bytes()).unwrap();
            let err = reader.next().unwrap().unwrap_err();
            assert!(matches!(err, GenotypeError::InvalidLine { line: 1, .. }), "{pos}: {err}");
        }
    }
}
