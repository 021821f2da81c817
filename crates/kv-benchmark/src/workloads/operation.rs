// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::str::FromStr;

use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::WeightedAliasIndex;

use crate::config::DistributionEntry;
use crate::error::ConfigError;

/// Shape of one simulated operation, parsed from strings such as
/// `-read 2 -write 1 -acl 1 -size 64`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationSpec {
    pub reads: u64,
    pub writes: u64,
    pub queries: u64,
    pub asserts: u64,
    pub conflicts: u64,
    pub acl: u64,
    pub size: u64,
}

impl OperationSpec {
    pub fn write_only(writes: u64) -> Self {
        Self {
            writes,
            ..Default::default()
        }
    }

    pub fn is_query(&self) -> bool {
        self.queries > 0
    }

    pub fn has_writes(&self) -> bool {
        self.writes > 0
    }

    /// How far the key cycle moves after this operation succeeds.
    pub fn key_advance(&self) -> u64 {
        self.writes.max(1)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.reads == 0 && self.writes == 0 && self.queries == 0 {
            return Err("an operation must include reads, writes or a query".into());
        }
        if self.queries > 0 && (self.reads > 0 || self.writes > 0 || self.asserts > 0) {
            return Err("a query cannot be combined with reads, writes or asserts".into());
        }
        if self.acl > 0 && self.writes == 0 {
            return Err("acl signers require at least one write".into());
        }
        if self.conflicts > 0 && self.writes == 0 {
            return Err("conflicts require at least one write".into());
        }
        if self.asserts > 0 && self.reads > 0 {
            return Err("asserts and reads are mutually exclusive".into());
        }
        Ok(())
    }
}

impl FromStr for OperationSpec {
    type Err = ConfigError;

    fn from_str(operation: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ConfigError::InvalidOperation {
            operation: operation.to_string(),
            reason,
        };

        let mut spec = OperationSpec::default();
        let mut seen = Vec::new();
        let mut tokens = operation.split_whitespace().peekable();
        while let Some(token) = tokens.next() {
            let flag = token
                .strip_prefix("--")
                .or_else(|| token.strip_prefix('-'))
                .ok_or_else(|| invalid(format!("expected a flag, found '{token}'")))?;
            let (name, value) = match flag.split_once('=') {
                Some((name, value)) => (name, value.to_string()),
                // A bare flag counts as one.
                None => match tokens.peek() {
                    Some(next) if !next.starts_with('-') => {
                        (flag, tokens.next().unwrap_or_default().to_string())
                    }
                    _ => (flag, "1".to_string()),
                },
            };
            let count: u64 = value
                .parse()
                .map_err(|_| invalid(format!("'{value}' is not a count for -{name}")))?;
            if seen.contains(&name) {
                return Err(invalid(format!("-{name} given twice")));
            }
            seen.push(name);

            let field = match name {
                "read" => &mut spec.reads,
                "write" => &mut spec.writes,
                "query" => &mut spec.queries,
                "assert" => &mut spec.asserts,
                "conflict" => &mut spec.conflicts,
                "acl" => &mut spec.acl,
                "size" => &mut spec.size,
                other => return Err(invalid(format!("unknown flag -{other}"))),
            };
            *field = count;
        }

        spec.validate().map_err(invalid)?;
        Ok(spec)
    }
}

impl fmt::Display for OperationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = [
            ("read", self.reads),
            ("write", self.writes),
            ("query", self.queries),
            ("assert", self.asserts),
            ("conflict", self.conflicts),
            ("acl", self.acl),
            ("size", self.size),
        ];
        let parts: Vec<String> = fields
            .iter()
            .filter(|(_, v)| *v > 0)
            .map(|(k, v)| format!("-{k} {v}"))
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}

/// Weighted random choice over the configured operation mix.
#[derive(Debug)]
pub struct OperationSelector {
    operations: Vec<OperationSpec>,
    dist: WeightedAliasIndex<u32>,
    rng: StdRng,
}

impl OperationSelector {
    pub fn new(entries: &[DistributionEntry]) -> Result<Self, ConfigError> {
        Self::with_rng(entries, StdRng::from_entropy())
    }

    pub fn with_seed(entries: &[DistributionEntry], seed: u64) -> Result<Self, ConfigError> {
        Self::with_rng(entries, StdRng::seed_from_u64(seed))
    }

    /// A selector that always yields `spec`.
    pub fn fixed(spec: OperationSpec) -> Result<Self, ConfigError> {
        spec.validate()
            .map_err(|reason| ConfigError::InvalidOperation {
                operation: spec.to_string(),
                reason,
            })?;
        Self::from_weights(vec![spec], vec![1], StdRng::from_entropy())
    }

    fn with_rng(entries: &[DistributionEntry], rng: StdRng) -> Result<Self, ConfigError> {
        let percent_based = entries.iter().any(|e| e.percent.is_some());
        if percent_based && entries.iter().any(|e| e.percent.is_none() || e.weight.is_some()) {
            return Err(ConfigError::InvalidDistribution(
                "percent and weight entries cannot be mixed".into(),
            ));
        }

        let mut operations = vec![];
        let mut weights = vec![];
        for entry in entries {
            let weight = entry.percent.or(entry.weight).unwrap_or(1);
            if weight == 0 {
                continue;
            }
            operations.push(entry.operation.parse::<OperationSpec>()?);
            weights.push(weight);
        }

        if percent_based {
            let sum: u64 = weights.iter().map(|w| u64::from(*w)).sum();
            if sum != 100 {
                return Err(ConfigError::InvalidDistribution(format!(
                    "percentages must sum to 100, got {sum}"
                )));
            }
        }
        if operations.is_empty() {
            return Err(ConfigError::InvalidDistribution(
                "no operation with a positive weight".into(),
            ));
        }
        Self::from_weights(operations, weights, rng)
    }

    fn from_weights(
        operations: Vec<OperationSpec>,
        weights: Vec<u32>,
        rng: StdRng,
    ) -> Result<Self, ConfigError> {
        let dist = WeightedAliasIndex::new(weights)
            .map_err(|e| ConfigError::InvalidDistribution(e.to_string()))?;
        Ok(Self {
            operations,
            dist,
            rng,
        })
    }

    pub fn operations(&self) -> &[OperationSpec] {
        &self.operations
    }

    pub fn draw(&mut self) -> OperationSpec {
        self.operations[self.dist.sample(&mut self.rng)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<OperationSpec, ConfigError> {
        s.parse()
    }

    #[test]
    fn parses_all_flags() {
        let spec = parse("-read 2 -write 1 -conflict 1 -acl 2 --size 64").unwrap();
        assert_eq!(
            spec,
            OperationSpec {
                reads: 2,
                writes: 1,
                queries: 0,
                asserts: 0,
                conflicts: 1,
                acl: 2,
                size: 64,
            }
        );
        assert_eq!(spec.to_string(), "-read 2 -write 1 -conflict 1 -acl 2 -size 64");
        assert_eq!(parse("-write").unwrap().writes, 1);
        assert_eq!(parse("-query=10").unwrap().queries, 10);
    }

    #[test]
    fn rejects_invalid_shapes() {
        for op in [
            "",
            "-size 10",
            "-query 5 -write 1",
            "-query 5 -read 1",
            "-read 1 -acl 1",
            "-read 1 -conflict 1",
            "-assert 1 -read 1 -write 1",
            "-read x",
            "-delete 1",
            "-read 1 -read 2",
            "read 1",
        ] {
            assert!(
                matches!(parse(op), Err(ConfigError::InvalidOperation { .. })),
                "{op} should be rejected"
            );
        }
        assert!(parse("-assert 2 -write 1").is_ok());
    }

    #[test]
    fn validates_distribution_at_construction() {
        let err = OperationSelector::new(&[DistributionEntry::percent(100, "-query 5 -write 1")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOperation { .. }));

        let err = OperationSelector::new(&[
            DistributionEntry::percent(60, "-read 1"),
            DistributionEntry::percent(30, "-write 1"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDistribution(_)));

        let err = OperationSelector::new(&[
            DistributionEntry::percent(100, "-read 1"),
            DistributionEntry::weighted(3, "-write 1"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDistribution(_)));

        // Percentages that wrap around u32 to exactly 100.
        let err = OperationSelector::new(&[
            DistributionEntry::percent(u32::MAX, "-read 1"),
            DistributionEntry::percent(101, "-write 1"),
        ])
        .unwrap_err();
        assert!(
            matches!(&err, ConfigError::InvalidDistribution(msg) if msg.contains("4294967396")),
            "{err}"
        );

        assert!(OperationSelector::new(&[]).is_err());

        // Zero-percent entries are skipped, not parsed.
        let selector = OperationSelector::new(&[
            DistributionEntry::percent(100, "-read 1"),
            DistributionEntry::percent(0, "-bogus"),
        ])
        .unwrap();
        assert_eq!(selector.operations().len(), 1);
    }

    #[test]
    fn draws_follow_weights() {
        let entries = [
            DistributionEntry::weighted(1, "-read 1"),
            DistributionEntry::weighted(3, "-write 1"),
            DistributionEntry::weighted(6, "-query 4"),
        ];
        let mut selector = OperationSelector::with_seed(&entries, 42).unwrap();
        let trials = 100_000;
        let mut counts = [0u32; 3];
        for _ in 0..trials {
            let spec = selector.draw();
            let idx = if spec.reads > 0 {
                0
            } else if spec.writes > 0 {
                1
            } else {
                2
            };
            counts[idx] += 1;
        }
        for (count, expected) in counts.iter().zip([0.1, 0.3, 0.6]) {
            let observed = *count as f64 / trials as f64;
            assert!((observed - expected).abs() < 0.01, "{observed} vs {expected}");
        }
    }

    #[test]
    fn unspecified_weight_defaults_to_one() {
        let entries = [
            DistributionEntry {
                percent: None,
                weight: None,
                operation: "-read 1".into(),
            },
            DistributionEntry::weighted(1, "-write 1"),
        ];
        let mut selector = OperationSelector::with_seed(&entries, 7).unwrap();
        let reads = (0..10_000).filter(|_| selector.draw().reads > 0).count();
        assert!((4_500..5_500).contains(&reads));
    }
}
