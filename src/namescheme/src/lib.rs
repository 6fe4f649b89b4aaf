// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Deterministic file naming for domain-decomposed datasets.
//!
//! A dataset split across `D` domains and `T` timesteps is stored as a
//! family of files. A [`NameScheme`] maps a `(domain, timestep)` index pair
//! to the identifier of the file holding that piece, and maps identifiers
//! recovered from directory listings back to index pairs. The two mappings
//! are exact inverses on the configured grid; consumers round-trip
//! identifiers through [`NameScheme::inverse`] and rely on getting the
//! original indices back.
//!
//! Two families are supported:
//!
//!  * [`Family::Flat`]: one file per domain, shared by every timestep.
//!  * [`Family::PerTimestep`]: one file per `(domain, timestep)` pair.
//!
//! The resolver holds only immutable configuration and may be shared freely.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How identifiers vary across the dataset grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Family {
    /// One identifier per domain, constant across timesteps.
    Flat,
    /// One identifier per `(domain, timestep)` pair.
    PerTimestep,
}

/// An error resolving or inverting a name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemeError {
    /// An index fell outside the configured grid.
    #[error("{what} index {index} outside configured grid of {count}")]
    OutOfRange {
        what: &'static str,
        index: u32,
        count: u32,
    },
    /// An identifier did not decode under this scheme.
    #[error("identifier {identifier:?} does not match the naming scheme")]
    NotMatched { identifier: String },
    /// The configured grid has no valid indices.
    #[error("a naming scheme requires at least one domain and one timestep")]
    EmptyGrid,
}

/// A deterministic mapping between dataset indices and file identifiers.
///
/// Identifiers are the base name followed by zero-padded index fields,
/// separated by dots: `base.TTTT.DDDD` for [`Family::PerTimestep`] and
/// `base.DDDD` for [`Family::Flat`]. Field widths are fixed by the grid at
/// construction time, so every identifier of one scheme has the same shape
/// and decodes unambiguously.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameScheme {
    base: String,
    family: Family,
    domains: u32,
    timesteps: u32,
    domain_width: usize,
    timestep_width: usize,
}

/// Minimum zero-padded field width.
///
/// Small grids still pad to four digits, the convention the surrounding
/// tooling expects (`density.0000.0003`).
const MIN_FIELD_WIDTH: usize = 4;

fn field_width(count: u32) -> usize {
    let max = count - 1;
    let needed = if max == 0 {
        1
    } else {
        usize::try_from(max.ilog10() + 1).expect("digit count fits in usize")
    };
    needed.max(MIN_FIELD_WIDTH)
}

impl NameScheme {
    /// Creates a scheme for a `domains` x `timesteps` grid.
    ///
    /// Fails with [`SchemeError::EmptyGrid`] if either count is zero.
    pub fn new(
        family: Family,
        base: impl Into<String>,
        domains: u32,
        timesteps: u32,
    ) -> Result<NameScheme, SchemeError> {
        if domains == 0 || timesteps == 0 {
            return Err(SchemeError::EmptyGrid);
        }
        Ok(NameScheme {
            base: base.into(),
            family,
            domains,
            timesteps,
            domain_width: field_width(domains),
            timestep_width: field_width(timesteps),
        })
    }

    /// Returns the identifier for the given grid position.
    ///
    /// Under [`Family::Flat`] the timestep is still range-checked but does
    /// not influence the identifier.
    pub fn resolve(&self, domain: u32, timestep: u32) -> Result<String, SchemeError> {
        self.check_range(domain, timestep)?;
        let id = match self.family {
            Family::Flat => format!(
                "{}.{:0width$}",
                self.base,
                domain,
                width = self.domain_width
            ),
            Family::PerTimestep => format!(
                "{}.{:0twidth$}.{:0dwidth$}",
                self.base,
                timestep,
                domain,
                twidth = self.timestep_width,
                dwidth = self.domain_width
            ),
        };
        Ok(id)
    }

    /// Decodes an identifier back to its `(domain, timestep)` pair.
    ///
    /// Under [`Family::Flat`] the returned timestep is `0`, the canonical
    /// representative of the identifier's timestep-independent family.
    pub fn inverse(&self, identifier: &str) -> Result<(u32, u32), SchemeError> {
        let not_matched = || SchemeError::NotMatched {
            identifier: identifier.to_owned(),
        };

        match self.family {
            Family::Flat => {
                let (prefix, domain) =
                    strip_suffix_field(identifier, self.domain_width).ok_or_else(not_matched)?;
                if prefix != self.base || domain >= self.domains {
                    return Err(not_matched());
                }
                Ok((domain, 0))
            }
            Family::PerTimestep => {
                let (rest, domain) =
                    strip_suffix_field(identifier, self.domain_width).ok_or_else(not_matched)?;
                let (prefix, timestep) =
                    strip_suffix_field(rest, self.timestep_width).ok_or_else(not_matched)?;
                if prefix != self.base {
                    return Err(not_matched());
                }
                if domain >= self.domains || timestep >= self.timesteps {
                    return Err(not_matched());
                }
                Ok((domain, timestep))
            }
        }
    }

    /// The number of domains in the grid.
    pub fn domains(&self) -> u32 {
        self.domains
    }

    /// The number of timesteps in the grid.
    pub fn timesteps(&self) -> u32 {
        self.timesteps
    }

    /// The identifier family.
    pub fn family(&self) -> Family {
        self.family
    }

    fn check_range(&self, domain: u32, timestep: u32) -> Result<(), SchemeError> {
        if domain >= self.domains {
            return Err(SchemeError::OutOfRange {
                what: "domain",
                index: domain,
                count: self.domains,
            });
        }
        if timestep >= self.timesteps {
            return Err(SchemeError::OutOfRange {
                what: "timestep",
                index: timestep,
                count: self.timesteps,
            });
        }
        Ok(())
    }
}

/// Splits `s` into the text before the final `.`-separated field and the
/// field's numeric value. The field must be exactly `width` ASCII digits for
/// the identifier to be considered a match.
fn strip_suffix_field(s: &str, width: usize) -> Option<(&str, u32)> {
    let (prefix, field) = s.rsplit_once('.')?;
    if field.len() != width || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value = field.parse::<u32>().ok()?;
    Some((prefix, value))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn flat_is_constant_across_timesteps() {
        let scheme = NameScheme::new(Family::Flat, "density", 8, 20).unwrap();
        let id = scheme.resolve(3, 12).unwrap();
        assert_eq!(id, scheme.resolve(3, 0).unwrap());
        assert_eq!(id, "density.0003");
        assert_eq!(scheme.inverse(&id).unwrap(), (3, 0));
    }

    #[test]
    fn per_timestep_varies_with_both_indices() {
        let scheme = NameScheme::new(Family::PerTimestep, "density", 8, 20).unwrap();
        assert_eq!(scheme.resolve(3, 12).unwrap(), "density.0012.0003");
        assert_ne!(
            scheme.resolve(3, 12).unwrap(),
            scheme.resolve(3, 11).unwrap()
        );
        assert_eq!(scheme.inverse("density.0012.0003").unwrap(), (3, 12));
    }

    #[test]
    fn wide_grids_widen_their_fields() {
        let scheme = NameScheme::new(Family::PerTimestep, "u", 20_000, 2).unwrap();
        assert_eq!(scheme.resolve(12_345, 1).unwrap(), "u.0001.12345");
        assert_eq!(scheme.inverse("u.0001.12345").unwrap(), (12_345, 1));
    }

    #[test]
    fn base_may_contain_dots() {
        let scheme = NameScheme::new(Family::PerTimestep, "run.2/wave", 4, 4).unwrap();
        let id = scheme.resolve(2, 3).unwrap();
        assert_eq!(id, "run.2/wave.0003.0002");
        assert_eq!(scheme.inverse(&id).unwrap(), (2, 3));
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        let scheme = NameScheme::new(Family::PerTimestep, "density", 8, 20).unwrap();
        assert_eq!(
            scheme.resolve(8, 0),
            Err(SchemeError::OutOfRange {
                what: "domain",
                index: 8,
                count: 8
            })
        );
        assert_eq!(
            scheme.resolve(0, 20),
            Err(SchemeError::OutOfRange {
                what: "timestep",
                index: 20,
                count: 20
            })
        );
    }

    #[test]
    fn foreign_identifiers_do_not_match() {
        let scheme = NameScheme::new(Family::PerTimestep, "density", 8, 20).unwrap();
        for id in [
            "density",
            "density.0003",          // flat shape
            "density.0012.0008",     // domain out of grid
            "density.0020.0003",     // timestep out of grid
            "pressure.0012.0003",    // wrong base
            "density.0012.003",      // narrow field
            "density.0012.00003",    // wide field
            "density.0012.000x",     // non-digit
            "density.0012.-003",     // sign
        ] {
            assert_eq!(
                scheme.inverse(id),
                Err(SchemeError::NotMatched {
                    identifier: id.to_owned()
                }),
                "identifier {:?} must not match",
                id
            );
        }
    }

    #[test]
    fn empty_grid_is_rejected() {
        assert_eq!(
            NameScheme::new(Family::Flat, "density", 0, 1).unwrap_err(),
            SchemeError::EmptyGrid
        );
        assert_eq!(
            NameScheme::new(Family::Flat, "density", 1, 0).unwrap_err(),
            SchemeError::EmptyGrid
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn per_timestep_round_trip(
            domains in 1..3000u32,
            timesteps in 1..3000u32,
            domain in 0..3000u32,
            timestep in 0..3000u32,
        ) {
            let domain = domain % domains;
            let timestep = timestep % timesteps;
            let scheme =
                NameScheme::new(Family::PerTimestep, "density", domains, timesteps).unwrap();
            let id = scheme.resolve(domain, timestep).unwrap();
            prop_assert_eq!(scheme.inverse(&id).unwrap(), (domain, timestep));
        }

        #[test]
        fn flat_round_trip(
            domains in 1..3000u32,
            timesteps in 1..3000u32,
            domain in 0..3000u32,
            timestep in 0..3000u32,
        ) {
            let domain = domain % domains;
            let timestep = timestep % timesteps;
            let scheme = NameScheme::new(Family::Flat, "density", domains, timesteps).unwrap();
            let id = scheme.resolve(domain, timestep).unwrap();
            // Flat identifiers canonicalize to timestep 0.
            prop_assert_eq!(scheme.inverse(&id).unwrap(), (domain, 0));
            prop_assert_eq!(id, scheme.resolve(domain, 0).unwrap());
        }
    }
}
