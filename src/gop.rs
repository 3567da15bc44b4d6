// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Mini-GOP structures.
//!
//! A mini-GOP of size `N` covers the `N` pictures following the previous anchor. Its
//! [`GopStructure`] lists them in coding order: the anchor (POC `N`) first, then the B pictures of
//! the hierarchy. POCs are relative to the previous anchor, which has POC 0.

pub mod adaptive;
pub mod predictor;

use std::str::FromStr;

use thiserror::Error;

use crate::encoder::CodingType;
pub use crate::gop::adaptive::AdaptiveGopThresholds;
pub use crate::gop::predictor::FrameDecision;
pub use crate::gop::predictor::MiniGop;
pub use crate::gop::predictor::MiniGopPredictor;

/// Largest mini-GOP.
pub const MAX_GOP_SIZE: usize = 8;

/// Sizes for which a structure is built in.
pub const BUILTIN_GOP_SIZES: [usize; 6] = [1, 2, 3, 4, 6, 8];

/// Slice type as seen by the look-ahead and the rate control.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SliceType {
    I,
    P,
    /// B picture used as a reference by other B pictures.
    BRef,
    B,
}

impl SliceType {
    pub fn coding_type(self) -> CodingType {
        match self {
            SliceType::I => CodingType::Intra,
            SliceType::P => CodingType::Predicted,
            SliceType::BRef | SliceType::B => CodingType::Bipredicted,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RefPic {
    /// POC distance to the reference, negative for past pictures.
    pub delta_poc: i32,
    /// Whether the reference is used to predict this picture, or only kept for later ones.
    pub used_by_cur: bool,
}

impl RefPic {
    const fn used(delta_poc: i32) -> Self {
        Self {
            delta_poc,
            used_by_cur: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GopPicConfig {
    pub coding_type: CodingType,
    pub poc: u32,
    pub qp_offset: i32,
    /// Lambda scaling handed to the hardware.
    pub qp_factor: f32,
    pub temporal_id: u32,
    pub refs: Vec<RefPic>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GopStructure {
    pics: Vec<GopPicConfig>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GopConfigError {
    #[error("line {line}: missing {field}")]
    MissingField { line: usize, field: &'static str },
    #[error("line {line}: invalid {field} {value:?}")]
    InvalidField {
        line: usize,
        field: &'static str,
        value: String,
    },
    #[error("line {line}: trailing data {data:?}")]
    TrailingData { line: usize, data: String },
    #[error("empty GOP structure")]
    Empty,
    #[error("GOP size {0} is larger than {MAX_GOP_SIZE}")]
    TooLarge(usize),
    #[error("POC {poc} is outside of 1..={size} or duplicated")]
    InvalidPoc { poc: u32, size: usize },
    #[error("POC {poc} references POC {target}, which is not coded before it")]
    InvalidReference { poc: u32, target: i64 },
    #[error("POC {poc} has no reference")]
    MissingReference { poc: u32 },
    #[error("the anchor picture cannot be bipredicted")]
    BipredictedAnchor,
}

/// Builds one entry of a built-in table.
fn pic(
    coding_type: CodingType,
    poc: u32,
    qp_offset: i32,
    temporal_id: u32,
    refs: &[i32],
) -> GopPicConfig {
    const QP_FACTORS: [f32; 4] = [0.4624, 0.3381, 0.4, 0.5];

    GopPicConfig {
        coding_type,
        poc,
        qp_offset,
        qp_factor: QP_FACTORS[temporal_id as usize],
        temporal_id,
        refs: refs.iter().copied().map(RefPic::used).collect(),
    }
}

impl GopStructure {
    pub fn new(pics: Vec<GopPicConfig>) -> Result<Self, GopConfigError> {
        let structure = Self { pics };
        structure.validate()?;
        Ok(structure)
    }

    /// Built-in hierarchical structure for `size`, if there is one.
    pub fn builtin(size: usize) -> Option<Self> {
        use CodingType::Bipredicted as B;
        use CodingType::Predicted as P;

        let pics = match size {
            1 => vec![pic(P, 1, 0, 0, &[-1])],
            2 => vec![pic(P, 2, 0, 0, &[-2]), pic(B, 1, 1, 1, &[-1, 1])],
            3 => vec![
                pic(P, 3, 0, 0, &[-3]),
                pic(B, 1, 1, 1, &[-1, 2]),
                pic(B, 2, 2, 2, &[-1, 1]),
            ],
            4 => vec![
                pic(P, 4, 0, 0, &[-4]),
                pic(B, 2, 1, 1, &[-2, 2]),
                pic(B, 1, 2, 2, &[-1, 1]),
                pic(B, 3, 2, 2, &[-1, 1]),
            ],
            6 => vec![
                pic(P, 6, 0, 0, &[-6]),
                pic(B, 3, 1, 1, &[-3, 3]),
                pic(B, 1, 2, 2, &[-1, 2]),
                pic(B, 2, 3, 3, &[-1, 1]),
                pic(B, 4, 2, 2, &[-1, 2]),
                pic(B, 5, 3, 3, &[-1, 1]),
            ],
            8 => vec![
                pic(P, 8, 0, 0, &[-8]),
                pic(B, 4, 1, 1, &[-4, 4]),
                pic(B, 2, 2, 2, &[-2, 2]),
                pic(B, 1, 3, 3, &[-1, 1]),
                pic(B, 3, 3, 3, &[-1, 1]),
                pic(B, 6, 2, 2, &[-2, 2]),
                pic(B, 5, 3, 3, &[-1, 1]),
                pic(B, 7, 3, 3, &[-1, 1]),
            ],
            _ => return None,
        };

        Some(Self { pics })
    }

    /// Largest built-in structure of at most `size` pictures.
    pub fn builtin_at_most(size: usize) -> Self {
        BUILTIN_GOP_SIZES
            .iter()
            .rev()
            .filter(|s| **s <= size)
            .find_map(|s| Self::builtin(*s))
            .unwrap_or_else(|| Self {
                pics: vec![pic(CodingType::Predicted, 1, 0, 0, &[-1])],
            })
    }

    fn validate(&self) -> Result<(), GopConfigError> {
        let size = self.pics.len();
        if size == 0 {
            return Err(GopConfigError::Empty);
        }
        if size > MAX_GOP_SIZE {
            return Err(GopConfigError::TooLarge(size));
        }

        let mut seen = vec![false; size + 1];
        seen[0] = true;
        for pic in &self.pics {
            let poc = pic.poc as usize;
            if poc == 0 || poc > size || seen[poc] {
                return Err(GopConfigError::InvalidPoc { poc: pic.poc, size });
            }

            if pic.coding_type != CodingType::Intra && pic.refs.is_empty() {
                return Err(GopConfigError::MissingReference { poc: pic.poc });
            }
            for r in &pic.refs {
                let target = i64::from(pic.poc) + i64::from(r.delta_poc);
                let coded_before = usize::try_from(target)
                    .ok()
                    .and_then(|t| seen.get(t).copied())
                    .unwrap_or(false);
                if !coded_before {
                    return Err(GopConfigError::InvalidReference {
                        poc: pic.poc,
                        target,
                    });
                }
            }

            if poc == size && pic.coding_type == CodingType::Bipredicted {
                return Err(GopConfigError::BipredictedAnchor);
            }

            seen[poc] = true;
        }

        Ok(())
    }

    pub fn size(&self) -> usize {
        self.pics.len()
    }

    /// Pictures in coding order.
    pub fn pics(&self) -> &[GopPicConfig] {
        &self.pics
    }

    /// Whether the picture at `idx` in coding order is referenced. The anchor always is, by the
    /// next mini-GOP.
    pub fn is_reference(&self, idx: usize) -> bool {
        let poc = self.pics[idx].poc;
        if poc as usize == self.size() {
            return true;
        }
        self.pics.iter().any(|other| {
            other
                .refs
                .iter()
                .any(|r| i64::from(other.poc) + i64::from(r.delta_poc) == i64::from(poc))
        })
    }

    pub fn slice_type(&self, idx: usize) -> SliceType {
        match self.pics[idx].coding_type {
            CodingType::Intra => SliceType::I,
            CodingType::Predicted => SliceType::P,
            CodingType::Bipredicted if self.is_reference(idx) => SliceType::BRef,
            CodingType::Bipredicted => SliceType::B,
        }
    }

    /// Share of the mini-GOP budget of every picture, in coding order, averaging to 1. Six QP
    /// more halves the share.
    pub fn bit_weights(&self) -> Vec<f64> {
        let raw = self
            .pics
            .iter()
            .map(|p| 2f64.powf(-f64::from(p.qp_offset) / 6.0))
            .collect::<Vec<_>>();
        let mean = raw.iter().sum::<f64>() / raw.len() as f64;
        raw.into_iter().map(|w| w / mean).collect()
    }

    /// The same structure with its anchor coded as an intra picture.
    pub fn with_intra_anchor(&self) -> Self {
        let size = self.size() as u32;
        let pics = self
            .pics
            .iter()
            .map(|p| {
                let mut p = p.clone();
                if p.poc == size {
                    p.coding_type = CodingType::Intra;
                    p.refs.clear();
                }
                p
            })
            .collect();

        Self { pics }
    }
}

struct Fields<'a> {
    line: usize,
    tokens: std::str::SplitWhitespace<'a>,
}

impl<'a> Fields<'a> {
    fn next_str(&mut self, field: &'static str) -> Result<&'a str, GopConfigError> {
        self.tokens.next().ok_or(GopConfigError::MissingField {
            line: self.line,
            field,
        })
    }

    fn parse<T: FromStr>(&mut self, field: &'static str) -> Result<T, GopConfigError> {
        let value = self.next_str(field)?;
        value.parse().map_err(|_| GopConfigError::InvalidField {
            line: self.line,
            field,
            value: value.to_string(),
        })
    }

    fn invalid(&self, field: &'static str, value: &str) -> GopConfigError {
        GopConfigError::InvalidField {
            line: self.line,
            field,
            value: value.to_string(),
        }
    }
}

fn parse_line(line: usize, text: &str) -> Result<GopPicConfig, GopConfigError> {
    let mut fields = Fields {
        line,
        tokens: text.split_whitespace(),
    };

    let label = fields.next_str("frame label")?;
    if !label.starts_with("Frame") || !label.ends_with(':') {
        return Err(fields.invalid("frame label", label));
    }

    let coding_type = match fields.next_str("picture type")? {
        "I" => CodingType::Intra,
        "P" => CodingType::Predicted,
        "B" => CodingType::Bipredicted,
        other => return Err(fields.invalid("picture type", other)),
    };
    let poc = fields.parse("POC")?;
    let qp_offset = fields.parse("QP offset")?;
    let qp_factor: f32 = fields.parse("QP factor")?;
    if !qp_factor.is_finite() || qp_factor < 0.0 {
        return Err(fields.invalid("QP factor", &qp_factor.to_string()));
    }
    let temporal_id = fields.parse("temporal id")?;
    let num_ref: usize = fields.parse("reference count")?;
    if num_ref > MAX_GOP_SIZE {
        return Err(fields.invalid("reference count", &num_ref.to_string()));
    }

    let mut deltas = Vec::new();
    for _ in 0..num_ref {
        deltas.push(fields.parse::<i32>("reference delta")?);
    }
    let mut refs = Vec::new();
    for delta_poc in deltas {
        let used_by_cur = match fields.parse::<u8>("used-by-current flag")? {
            0 => false,
            1 => true,
            other => return Err(fields.invalid("used-by-current flag", &other.to_string())),
        };
        refs.push(RefPic {
            delta_poc,
            used_by_cur,
        });
    }

    let rest = fields.tokens.collect::<Vec<_>>();
    if !rest.is_empty() {
        return Err(GopConfigError::TrailingData {
            line,
            data: rest.join(" "),
        });
    }

    Ok(GopPicConfig {
        coding_type,
        poc,
        qp_offset,
        qp_factor,
        temporal_id,
        refs,
    })
}

impl FromStr for GopStructure {
    type Err = GopConfigError;

    /// Parses one picture per line, in coding order:
    ///
    /// `FrameN: <I|P|B> <poc> <qp_offset> <qp_factor> <temporal_id> <num_ref> <ref_delta...>
    /// <used_by_cur...>`
    ///
    /// Blank lines and `#` comments are ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut pics = Vec::new();
        for (idx, line) in s.lines().enumerate() {
            let text = line.split('#').next().unwrap_or_default().trim();
            if text.is_empty() {
                continue;
            }
            if pics.len() == MAX_GOP_SIZE {
                return Err(GopConfigError::TooLarge(pics.len() + 1));
            }
            pics.push(parse_line(idx + 1, text)?);
        }

        Self::new(pics)
    }
}

/// How the mini-GOP size is chosen.
#[derive(Clone, Debug, PartialEq)]
pub enum GopSize {
    /// Always the same size, one of [`BUILTIN_GOP_SIZES`].
    Fixed(usize),
    /// Decided after every mini-GOP by [`adaptive::AdaptiveGop`].
    Adaptive,
    /// A user supplied structure.
    Custom(GopStructure),
}

#[derive(Clone, Debug, PartialEq)]
pub struct GopConfig {
    pub size: GopSize,
    /// Distance between intra pictures. 0 codes only the first picture as intra.
    pub intra_period: u32,
    /// Every `ltr_interval`-th P picture refreshes the long-term reference. 0 disables it.
    pub ltr_interval: u32,
    pub thresholds: AdaptiveGopThresholds,
}

impl Default for GopConfig {
    fn default() -> Self {
        Self {
            size: GopSize::Fixed(4),
            intra_period: 0,
            ltr_interval: 0,
            thresholds: AdaptiveGopThresholds::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_tables_are_valid() {
        for size in BUILTIN_GOP_SIZES {
            let gop = GopStructure::builtin(size).unwrap();
            assert_eq!(gop.size(), size);
            gop.validate().unwrap();
            assert_eq!(gop.slice_type(0), SliceType::P);

            let weights = gop.bit_weights();
            let mean = weights.iter().sum::<f64>() / size as f64;
            assert!((mean - 1.0).abs() < 1e-9);
            assert!(weights.iter().all(|w| *w <= weights[0]));
        }
        assert!(GopStructure::builtin(5).is_none());
    }

    #[test]
    fn reference_b_pictures() {
        let gop = GopStructure::builtin(4).unwrap();
        let slice_types = (0..4).map(|i| gop.slice_type(i)).collect::<Vec<_>>();
        assert_eq!(
            slice_types,
            vec![SliceType::P, SliceType::BRef, SliceType::B, SliceType::B]
        );
    }

    #[test]
    fn intra_anchor() {
        let gop = GopStructure::builtin(3).unwrap().with_intra_anchor();
        assert_eq!(gop.pics()[0].coding_type, CodingType::Intra);
        assert!(gop.pics()[0].refs.is_empty());
        gop.validate().unwrap();
    }

    #[test]
    fn parse_text_table() {
        let text = "
            # poc qp_offset qp_factor temporal_id num_ref deltas used
            Frame1: P 4 0 0.4624 0 1 -4 1
            Frame2: B 2 1 0.3381 1 2 -2 2 1 1
            Frame3: B 1 2 0.4 2 2 -1 1 1 1   # first half
            Frame4: B 3 2 0.4 2 3 -1 1 -3 1 1 0
        ";
        let gop = text.parse::<GopStructure>().unwrap();

        assert_eq!(gop.size(), 4);
        assert_eq!(gop.pics()[1].qp_factor, 0.3381);
        assert_eq!(
            gop.pics()[3].refs[2],
            RefPic {
                delta_poc: -3,
                used_by_cur: false
            }
        );
        assert_eq!(gop.slice_type(1), SliceType::BRef);
    }

    #[test]
    fn parse_errors() {
        assert_eq!("".parse::<GopStructure>(), Err(GopConfigError::Empty));
        assert_eq!(
            "Frame1: P 1 0 0.5 0 1".parse::<GopStructure>(),
            Err(GopConfigError::MissingField {
                line: 1,
                field: "reference delta"
            })
        );
        assert_eq!(
            "Frame1: X 1 0 0.5 0 1 -1 1".parse::<GopStructure>(),
            Err(GopConfigError::InvalidField {
                line: 1,
                field: "picture type",
                value: "X".into()
            })
        );
        assert_eq!(
            "Frame1: P 1 0 0.5 0 1 -1 1 7".parse::<GopStructure>(),
            Err(GopConfigError::TrailingData {
                line: 1,
                data: "7".into()
            })
        );
        // POC 1 is coded after POC 2 but referenced by it.
        assert_eq!(
            "Frame1: P 2 0 0.5 0 1 -1 1\nFrame2: B 1 0 0.5 0 1 -1 1".parse::<GopStructure>(),
            Err(GopConfigError::InvalidReference { poc: 2, target: 1 })
        );
        assert_eq!(
            "Frame1: P 3 0 0.5 0 1 -3 1".parse::<GopStructure>(),
            Err(GopConfigError::InvalidPoc { poc: 3, size: 1 })
        );
        assert_eq!(
            "Frame1: B 1 0 0.5 0 1 -1 1".parse::<GopStructure>(),
            Err(GopConfigError::BipredictedAnchor)
        );
    }
}
