//! The coordinate spaces of a subject and the ordered pairs between them.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, TransformError};

/// One of the seven coordinate spaces a subject's images can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Space {
    /// Native high-resolution T1.
    Hr,
    /// Resting-state EPI.
    Rs,
    /// Task EPI.
    Fmri,
    /// Diffusion (nodiff volume).
    Dti,
    /// Secondary T2 structural.
    T2,
    /// MNI standard, 2mm.
    Std,
    /// MNI standard, 4mm.
    Std4,
}

impl Space {
    pub const ALL: [Space; 7] = [
        Space::Hr,
        Space::Rs,
        Space::Fmri,
        Space::Dti,
        Space::T2,
        Space::Std,
        Space::Std4,
    ];

    /// The short name used in folder and artifact names, e.g. `reg_std4`, `dti2hr`.
    pub fn label(&self) -> &'static str {
        match self {
            Space::Hr => "hr",
            Space::Rs => "rs",
            Space::Fmri => "fmri",
            Space::Dti => "dti",
            Space::T2 => "t2",
            Space::Std => "std",
            Space::Std4 => "std4",
        }
    }

    /// Whether a subject may lack this space. HR and the two standard grids are mandatory.
    pub fn is_optional(&self) -> bool {
        !matches!(self, Space::Hr | Space::Std | Space::Std4)
    }

    /// Whether this is one of the two MNI template grids.
    pub fn is_standard(&self) -> bool {
        matches!(self, Space::Std | Space::Std4)
    }

    /// Isotropic voxel size of the standard grids, in mm.
    pub fn standard_resolution(&self) -> Option<u32> {
        match self {
            Space::Std => Some(2),
            Space::Std4 => Some(4),
            _ => None,
        }
    }
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for Space {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Space> {
        let name = s.trim().to_ascii_lowercase();
        Space::ALL
            .iter()
            .copied()
            .find(|space| space.label() == name)
            .ok_or(TransformError::UnknownSpace { name })
    }
}


/// An ordered (source, destination) pair of spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpacePair {
    pub source: Space,
    pub dest: Space,
}

impl SpacePair {
    pub fn new(source: Space, dest: Space) -> SpacePair {
        SpacePair { source, dest }
    }

    pub fn reversed(&self) -> SpacePair {
        SpacePair::new(self.dest, self.source)
    }

    /// All 42 ordered pairs of distinct spaces.
    pub fn all() -> impl Iterator<Item = SpacePair> {
        Space::ALL.iter().flat_map(|&source| {
            Space::ALL
                .iter()
                .filter(move |&&dest| dest != source)
                .map(move |&dest| SpacePair::new(source, dest))
        })
    }
}

impl fmt::Display for SpacePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}2{}", self.source, self.dest)
    }
}

/// Parses keys such as `hr2std`, `rs2std4` or `std2dti`.
impl FromStr for SpacePair {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<SpacePair> {
        let key = s.trim().to_ascii_lowercase();
        // "std2std4" contains two candidate separators, so try every '2' that
        // splits the key into two known labels.
        for (idx, _) in key.match_indices('2') {
            let (source, dest) = (&key[..idx], &key[idx + 1..]);
            if let (Ok(source), Ok(dest)) = (source.parse::<Space>(), dest.parse::<Space>()) {
                return Ok(SpacePair::new(source, dest));
            }
        }
        Err(TransformError::UnknownSpace { name: key })
    }
}


/// A request for the transform of one ordered pair, linear or non-linear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransformRequest {
    pub pair: SpacePair,
    pub linear: bool,
}

impl TransformRequest {
    pub fn new(source: Space, dest: Space, linear: bool) -> TransformRequest {
        TransformRequest {
            pair: SpacePair::new(source, dest),
            linear,
        }
    }

    pub fn source(&self) -> Space {
        self.pair.source
    }

    pub fn dest(&self) -> Space {
        self.pair.dest
    }

    /// The same pair with the linearity flag replaced.
    pub fn with_linear(&self, linear: bool) -> TransformRequest {
        TransformRequest { pair: self.pair, linear }
    }
}

impl fmt::Display for TransformRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.linear { "linear" } else { "non-linear" };
        write!(f, "{} ({})", self.pair, mode)
    }
}
