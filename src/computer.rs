//! Guaranteeing that a transform artifact exists, computing it on demand.
//!
//! The filesystem is the cache: an artifact whose canonical file is complete is
//! returned untouched, anything else is built from its recipe after recursively
//! guaranteeing the recipe's inputs. Shared inputs of a diamond dependency are
//! thus computed once.

use crate::catalog::{self, Artifact, Registration, Resolution, TransformRecipe};
use crate::config::TransformConfig;
use crate::error::{Result, TransformError};
use crate::image::ImageHandle;
use crate::runner::{execute, OutputKind, ToolCommand, ToolRunner};
use crate::space::{Space, TransformRequest};
use crate::subject::{ImageRole, SubjectContext};

/// Recursion bound of recipe evaluation. The catalog never nests deeper than 6.
pub const MAX_RECIPE_DEPTH: usize = 8;

/// Something that can guarantee the artifact of a space pair.
pub trait EnsureTransform {
    /// Return the artifact serving `source -> dest`, computing it if needed.
    /// On a non-linear to linear fallback the returned artifact is linear.
    fn ensure(&self, source: Space, dest: Space, linear: bool) -> Result<Artifact>;
}


pub struct TransformComputer<'a> {
    ctx: &'a SubjectContext,
    runner: &'a dyn ToolRunner,
    config: &'a TransformConfig,
}

impl<'a> TransformComputer<'a> {
    pub fn new(
        ctx: &'a SubjectContext,
        runner: &'a dyn ToolRunner,
        config: &'a TransformConfig,
    ) -> TransformComputer<'a> {
        TransformComputer { ctx, runner, config }
    }

    pub fn context(&self) -> &'a SubjectContext {
        self.ctx
    }

    pub fn runner(&self) -> &'a dyn ToolRunner {
        self.runner
    }

    pub fn config(&self) -> &'a TransformConfig {
        self.config
    }

    pub fn ensure_request(&self, request: TransformRequest) -> Result<Artifact> {
        self.ensure_at(request, 0)
    }

    fn ensure_at(&self, request: TransformRequest, depth: usize) -> Result<Artifact> {
        if depth > MAX_RECIPE_DEPTH {
            tracing::error!(subject = self.ctx.label(), %request, depth, "recipe recursion bound exceeded");
            return Err(TransformError::RecipeLoop { request, depth });
        }
        for space in [request.source(), request.dest()].iter() {
            if !self.ctx.has_space(*space) {
                return Err(TransformError::MissingModality {
                    subject: self.ctx.label().to_string(),
                    space: *space,
                    request,
                });
            }
        }

        let res = catalog::resolve(self.ctx, request.source(), request.dest(), request.linear)?;
        if let Some(fallback) = res.fallback {
            tracing::warn!(
                subject = self.ctx.label(),
                requested = %res.requested,
                served = %res.artifact.request,
                "non-linear transform unavailable ({}), using the linear one",
                fallback
            );
        }
        if res.artifact.is_complete() {
            tracing::debug!(subject = self.ctx.label(), artifact = %res.artifact, "transform already computed");
            return Ok(res.artifact);
        }

        tracing::info!(
            subject = self.ctx.label(),
            transform = %res.artifact.request,
            path = %res.artifact,
            "computing transform"
        );
        let command = match res.recipe {
            TransformRecipe::Direct(registration) => self.register(&res, registration, depth)?,
            TransformRecipe::ConcatMatrix { first, second } => {
                let first = self.ensure_at(first, depth + 1)?;
                let second = self.ensure_at(second, depth + 1)?;
                // convert_xfm applies the second matrix after the first
                ToolCommand::new("convert_xfm")
                    .output("-omat", OutputKind::Matrix, &res.artifact.path)
                    .arg("-concat")
                    .path("", &second.path)
                    .path("", &first.path)
            }
            TransformRecipe::ComposeWarp { premat, warp1, warp2, postmat } => {
                let premat = premat.map(|r| self.ensure_at(r, depth + 1)).transpose()?;
                let warp1 = self.ensure_at(warp1, depth + 1)?;
                let warp2 = warp2.map(|r| self.ensure_at(r, depth + 1)).transpose()?;
                let postmat = postmat.map(|r| self.ensure_at(r, depth + 1)).transpose()?;
                let reference = self.require(&res, self.ctx.representative_image(request.dest()))?;

                let mut cmd = ToolCommand::new("convertwarp").image("--ref=", &reference);
                if let Some(premat) = premat {
                    cmd = cmd.path("--premat=", &premat.path);
                }
                cmd = cmd.image("--warp1=", &warp1.warp());
                if let Some(warp2) = warp2 {
                    cmd = cmd.image("--warp2=", &warp2.warp());
                }
                if let Some(postmat) = postmat {
                    cmd = cmd.path("--postmat=", &postmat.path);
                }
                cmd.output("--out=", OutputKind::Image, &res.artifact.path)
            }
            TransformRecipe::InvertExisting { forward } => {
                let forward = self.ensure_at(forward, depth + 1)?;
                if forward.is_warp() {
                    // inverted against the geometry of the space we invert into
                    let reference = self.require(&res, self.ctx.representative_image(request.dest()))?;
                    ToolCommand::new("invwarp")
                        .image("--warp=", &forward.warp())
                        .image("--ref=", &reference)
                        .output("--out=", OutputKind::Image, &res.artifact.path)
                } else {
                    ToolCommand::new("convert_xfm")
                        .output("-omat", OutputKind::Matrix, &res.artifact.path)
                        .arg("-inverse")
                        .path("", &forward.path)
                }
            }
        };

        execute(self.runner, &command).map_err(|err| err.for_request(self.ctx.label(), res.artifact.request))?;
        tracing::info!(subject = self.ctx.label(), artifact = %res.artifact, "transform written");
        Ok(res.artifact)
    }

    /// Build the registration command of a `Direct` recipe.
    fn register(&self, res: &Resolution, registration: Registration, depth: usize) -> Result<ToolCommand> {
        let (s, d) = (res.artifact.request.source(), res.artifact.request.dest());
        let interp = self.config.interpolation.fsl_name();

        let command = match registration {
            Registration::Flirt { cost, dof } => {
                let moving = self.require(res, self.ctx.representative_image(s))?;
                let fixed = self.require(res, self.ctx.representative_image(d))?;
                let range = self.config.search_range;
                ToolCommand::new("flirt")
                    .arg("-in")
                    .image("", &moving)
                    .arg("-ref")
                    .image("", &fixed)
                    .output("-omat", OutputKind::Matrix, &res.artifact.path)
                    .args(vec![
                        String::from("-cost"),
                        cost.fsl_name().to_string(),
                        String::from("-dof"),
                        dof.to_string(),
                    ])
                    .args(search_range_args(range))
                    .args(vec!["-interp", interp])
            }
            Registration::IsoResample { resolution } => {
                let moving = self.require(res, self.ctx.representative_image(s))?;
                let fixed = self.require(res, self.ctx.representative_image(d))?;
                let identity = self.config.identity_matrix();
                if !identity.is_file() {
                    return Err(self.missing(res, identity));
                }
                ToolCommand::new("flirt")
                    .arg("-in")
                    .image("", &moving)
                    .arg("-ref")
                    .image("", &fixed)
                    .arg("-out")
                    .path("", self.ctx.reg_dir(d).join(res.artifact.request.pair.to_string()))
                    .output("-omat", OutputKind::Matrix, &res.artifact.path)
                    .arg("-init")
                    .path("", identity)
                    .arg("-applyisoxfm")
                    .arg(resolution.to_string())
                    .args(vec!["-interp", interp])
            }
            Registration::Fnirt { moving, fixed, with_config } => {
                let moving = self.require(res, self.ctx.image(s, moving))?;
                let fixed = self.require(res, self.ctx.image(d, fixed))?;
                let mask = self.require(res, self.ctx.image(d, ImageRole::MaskDil))?;
                let affine = self.ensure_at(res.artifact.request.with_linear(true), depth + 1)?;

                let byproduct = self.ctx.reg_dir(d).join(res.artifact.request.pair.to_string());
                let [wx, wy, wz] = self.config.warp_resolution;
                let mut cmd = ToolCommand::new("fnirt")
                    .image("--in=", &moving)
                    .image("--ref=", &fixed)
                    .path("--aff=", &affine.path)
                    .image("--refmask=", &mask);
                if with_config {
                    cmd = cmd.arg(format!("--config={}", self.config.fnirt_config));
                }
                cmd.arg(format!("--warpres={},{},{}", wx, wy, wz))
                    .output("--cout=", OutputKind::Image, &res.artifact.path)
                    .path("--iout=", byproduct.with_file_name(format!("{}_resampled", res.artifact.request.pair)))
                    .path("--jout=", byproduct.with_file_name(format!("{}_jac", res.artifact.request.pair)))
            }
        };
        Ok(command)
    }

    /// `img` if it exists, `MissingPrerequisite` otherwise.
    fn require(&self, res: &Resolution, img: ImageHandle) -> Result<ImageHandle> {
        if img.exists() {
            Ok(img)
        } else {
            Err(self.missing(res, img.path().to_path_buf()))
        }
    }

    fn missing(&self, res: &Resolution, path: std::path::PathBuf) -> TransformError {
        tracing::error!(subject = self.ctx.label(), transform = %res.artifact.request, path = %path.display(), "prerequisite missing");
        TransformError::MissingPrerequisite {
            subject: self.ctx.label().to_string(),
            request: res.artifact.request,
            path,
        }
    }
}

impl EnsureTransform for TransformComputer<'_> {
    fn ensure(&self, source: Space, dest: Space, linear: bool) -> Result<Artifact> {
        self.ensure_request(TransformRequest::new(source, dest, linear))
    }
}


fn search_range_args(range: u32) -> Vec<String> {
    let (lo, hi) = (format!("-{}", range), range.to_string());
    ["-searchrx", "-searchry", "-searchrz"]
        .iter()
        .flat_map(|axis| vec![axis.to_string(), lo.clone(), hi.clone()])
        .collect()
}
