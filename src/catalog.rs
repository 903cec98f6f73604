//! The static table of how to obtain the transform between any two spaces.
//!
//! Every request is answered by one of four recipes: register two images
//! directly, concatenate two affines, compose a warp with bracketing affines,
//! or invert a transform computed the other way round. The table also holds the
//! policy on non-linear requests that have no warp route: they are answered with
//! the linear artifact of the same pair.
//!
//! Nothing here touches the filesystem. Resolution is a pure function of the
//! request, the subject layout and whether the subject has a T2.

use std::fmt;
use std::path::PathBuf;

use crate::error::{Result, TransformError};
use crate::image::{ImageHandle, MatrixHandle};
use crate::runner::OutputKind;
use crate::space::{Space, TransformRequest};
use crate::subject::{ImageRole, SubjectContext};

/// Cost function of a linear registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cost {
    /// Within-contrast pairs (T1-like images).
    CorrRatio,
    /// Cross-contrast pairs (DTI, T2 against anything).
    NormMi,
}

impl Cost {
    pub fn fsl_name(&self) -> &'static str {
        match self {
            Cost::CorrRatio => "corratio",
            Cost::NormMi => "normmi",
        }
    }
}

/// How two concrete images are registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Registration {
    /// `flirt` between the representative images.
    Flirt { cost: Cost, dof: u32 },
    /// `flirt -applyisoxfm`: the standard grids only differ by voxel size.
    IsoResample { resolution: u32 },
    /// `fnirt`, initialised with the linear artifact of the same pair.
    Fnirt {
        moving: ImageRole,
        fixed: ImageRole,
        /// Pass the configured `--config` schedule (HR to standard only).
        with_config: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformRecipe {
    Direct(Registration),
    /// `second ∘ first`, both affines.
    ConcatMatrix {
        first: TransformRequest,
        second: TransformRequest,
    },
    /// One `convertwarp` call: `[postmat ∘] [warp2 ∘] warp1 [∘ premat]`.
    ComposeWarp {
        premat: Option<TransformRequest>,
        warp1: TransformRequest,
        warp2: Option<TransformRequest>,
        postmat: Option<TransformRequest>,
    },
    /// Inverse of the transform of the reversed pair.
    InvertExisting { forward: TransformRequest },
}

impl TransformRecipe {
    /// The requests that must be satisfied before this recipe can run, in order.
    pub fn prerequisites(&self, artifact: &TransformRequest) -> Vec<TransformRequest> {
        match *self {
            TransformRecipe::Direct(Registration::Fnirt { .. }) => vec![artifact.with_linear(true)],
            TransformRecipe::Direct(_) => Vec::new(),
            TransformRecipe::ConcatMatrix { first, second } => vec![first, second],
            TransformRecipe::ComposeWarp { premat, warp1, warp2, postmat } => premat
                .into_iter()
                .chain(Some(warp1))
                .chain(warp2)
                .chain(postmat)
                .collect(),
            TransformRecipe::InvertExisting { forward } => vec![forward],
        }
    }
}

/// Why a non-linear request was answered with a linear artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fallback {
    /// The pair has no warp route at all.
    LinearOnlyPair,
    /// STD and STD4 only differ in voxel size.
    StandardResample,
    /// DTI and HR are only warped through T2, which this subject lacks.
    NoT2Route,
}

impl fmt::Display for Fallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Fallback::LinearOnlyPair => "no non-linear route exists for this pair",
            Fallback::StandardResample => "standard grids differ only by resolution",
            Fallback::NoT2Route => "subject has no T2 to route the warp through",
        };
        write!(f, "{}", text)
    }
}


/// A transform file: a `.mat` affine for linear requests, a warp field otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Artifact {
    pub request: TransformRequest,
    pub path: PathBuf,
}

impl Artifact {
    pub fn kind(&self) -> OutputKind {
        if self.request.linear {
            OutputKind::Matrix
        } else {
            OutputKind::Image
        }
    }

    pub fn is_warp(&self) -> bool {
        !self.request.linear
    }

    pub fn matrix(&self) -> MatrixHandle {
        MatrixHandle::new(&self.path)
    }

    pub fn warp(&self) -> ImageHandle {
        ImageHandle::new(&self.path)
    }

    /// Whether a complete file is on disk. This is the memoization check.
    pub fn is_complete(&self) -> bool {
        match self.kind() {
            OutputKind::Matrix => self.matrix().is_complete(),
            OutputKind::Image => self.warp().is_complete(),
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}


/// The answer to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// What the caller asked for.
    pub requested: TransformRequest,
    /// What will be produced; differs from `requested` only in linearity, on fallback.
    pub artifact: Artifact,
    pub recipe: TransformRecipe,
    pub fallback: Option<Fallback>,
}

impl Resolution {
    pub fn steps(&self) -> Vec<TransformRequest> {
        self.recipe.prerequisites(&self.artifact.request)
    }
}


/// `roi/reg_<dest>/<source>2<dest>.mat` or `roi/reg_<dest>/<source>2<dest>_warp`.
pub fn artifact_path(ctx: &SubjectContext, request: &TransformRequest) -> PathBuf {
    let suffix = if request.linear { ".mat" } else { "_warp" };
    ctx.reg_dir(request.dest())
        .join(format!("{}{}", request.pair, suffix))
}

/// Resolve a request against a subject: artifact location, recipe and fallback.
pub fn resolve(ctx: &SubjectContext, source: Space, dest: Space, linear: bool) -> Result<Resolution> {
    let requested = TransformRequest::new(source, dest, linear);
    let (effective, recipe, fallback) = recipe(requested, ctx.has_space(Space::T2))?;
    Ok(Resolution {
        requested,
        artifact: Artifact {
            request: effective,
            path: artifact_path(ctx, &effective),
        },
        recipe,
        fallback,
    })
}

/// The recipe table proper. Returns the request actually served (linear on
/// fallback), its recipe and the fallback applied, if any.
pub fn recipe(
    request: TransformRequest,
    has_t2: bool,
) -> Result<(TransformRequest, TransformRecipe, Option<Fallback>)> {
    let (s, d) = (request.source(), request.dest());
    if s == d || (is_epi(s) && d == Space::Dti) || (s == Space::Dti && is_epi(d)) {
        return Err(TransformError::UnsupportedPair { request });
    }

    let fallback = if request.linear {
        None
    } else {
        nonlinear_fallback(s, d, has_t2)
    };
    let effective = if fallback.is_some() {
        request.with_linear(true)
    } else {
        request
    };

    let recipe = if effective.linear {
        Some(linear_recipe(s, d))
    } else {
        warp_recipe(s, d, has_t2)
    };
    match recipe {
        Some(recipe) => Ok((effective, recipe, fallback)),
        None => Err(TransformError::UnsupportedPair { request }),
    }
}


fn is_epi(space: Space) -> bool {
    matches!(space, Space::Rs | Space::Fmri)
}

fn lin(source: Space, dest: Space) -> TransformRequest {
    TransformRequest::new(source, dest, true)
}

fn warp(source: Space, dest: Space) -> TransformRequest {
    TransformRequest::new(source, dest, false)
}

fn nonlinear_fallback(s: Space, d: Space, has_t2: bool) -> Option<Fallback> {
    use Space::*;
    match (s, d) {
        (Std, Std4) | (Std4, Std) => Some(Fallback::StandardResample),
        (Rs, Hr) | (Hr, Rs) | (Fmri, Hr) | (Hr, Fmri) | (T2, Hr) | (Hr, T2) => {
            Some(Fallback::LinearOnlyPair)
        }
        // composed from linear-only pairs through HR
        (Rs, Fmri) | (Fmri, Rs) | (Rs, T2) | (T2, Rs) | (Fmri, T2) | (T2, Fmri) => {
            Some(Fallback::LinearOnlyPair)
        }
        (Dti, Hr) | (Hr, Dti) if !has_t2 => Some(Fallback::NoT2Route),
        _ => None,
    }
}

fn linear_recipe(s: Space, d: Space) -> TransformRecipe {
    use Space::*;
    use TransformRecipe::*;

    let concat = |a: Space, via: Space, b: Space| ConcatMatrix {
        first: lin(a, via),
        second: lin(via, b),
    };
    let within = Direct(Registration::Flirt { cost: Cost::CorrRatio, dof: 12 });
    let cross = Direct(Registration::Flirt { cost: Cost::NormMi, dof: 7 });
    // EPI to T1 stays rigid
    let epi = Direct(Registration::Flirt { cost: Cost::CorrRatio, dof: 6 });

    match (s, d) {
        (Hr, Std) => within,
        (Rs, Hr) | (Fmri, Hr) => epi,
        (Dti, Hr) | (Dti, T2) | (T2, Hr) => cross,
        (Std, Std4) | (Std4, Std) => Direct(Registration::IsoResample {
            resolution: d.standard_resolution().unwrap_or(2),
        }),
        (Std, Hr) | (Hr, Rs) | (Hr, Fmri) | (Hr, Dti) | (T2, Dti) | (Hr, T2) => {
            InvertExisting { forward: lin(d, s) }
        }
        (Hr, Std4) => concat(Hr, Std, Std4),
        (Std4, Hr) => concat(Std4, Std, Hr),
        (Std4, _) => concat(Std4, Std, d),
        (_, Std4) => concat(s, Std, Std4),
        (Std, _) => concat(Std, Hr, d),
        (_, Std) => concat(s, Hr, Std),
        // RS <-> FMRI and EPI <-> T2
        _ => concat(s, Hr, d),
    }
}

fn warp_recipe(s: Space, d: Space, has_t2: bool) -> Option<TransformRecipe> {
    use Space::*;
    use TransformRecipe::*;

    let compose = |premat: Option<TransformRequest>,
                   warp1: TransformRequest,
                   warp2: Option<TransformRequest>,
                   postmat: Option<TransformRequest>| ComposeWarp {
        premat,
        warp1,
        warp2,
        postmat,
    };

    let recipe = match (s, d) {
        (Hr, Std) => Direct(Registration::Fnirt {
            moving: ImageRole::Head,
            fixed: ImageRole::Head,
            with_config: true,
        }),
        (Dti, T2) => Direct(Registration::Fnirt {
            moving: ImageRole::Brain,
            fixed: ImageRole::Brain,
            with_config: false,
        }),
        (Std, Hr) | (T2, Dti) | (Std, Rs) | (Std, Fmri) => InvertExisting { forward: warp(d, s) },

        // only reached with a T2, see nonlinear_fallback
        (Dti, Hr) => compose(None, warp(Dti, T2), None, Some(lin(T2, Hr))),
        (Hr, Dti) => compose(Some(lin(Hr, T2)), warp(T2, Dti), None, None),

        (Dti, Std) if has_t2 => compose(None, warp(Dti, Hr), Some(warp(Hr, Std)), None),
        (Std, Dti) if has_t2 => compose(None, warp(Std, Hr), Some(warp(Hr, Dti)), None),
        (Std, Dti) | (Std, T2) => compose(None, warp(Std, Hr), None, Some(lin(Hr, d))),
        (Rs, Std) | (Fmri, Std) | (Dti, Std) | (T2, Std) => {
            compose(Some(lin(s, Hr)), warp(Hr, Std), None, None)
        }

        (Std4, _) if d != Std => compose(Some(lin(Std4, Std)), warp(Std, d), None, None),
        (_, Std4) if s != Std => compose(None, warp(s, Std), None, Some(lin(Std, Std4))),
        _ => return None,
    };
    Some(recipe)
}
