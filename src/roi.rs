//! Moving regions of interest from one space into another.

use std::collections::HashSet;
use std::path::PathBuf;

use crate::catalog::Artifact;
use crate::computer::{EnsureTransform, TransformComputer};
use crate::config::Interpolation;
use crate::error::{Result, TransformError};
use crate::image::ImageHandle;
use crate::runner::{execute, OutputKind, ToolCommand, ToolRunner};
use crate::space::{SpacePair, TransformRequest};
use crate::subject::SubjectContext;

/// How the ROI strings passed to [`RoiTransformer::transform_roi`] are turned into paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathType {
    Absolute,
    RelativeToSubjectRoot,
    /// A name in `roi/<source space>` of the subject.
    NamedInSourceSpaceFolder,
}

/// The result of one ROI.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedRoi {
    pub input: ImageHandle,
    pub output: ImageHandle,
    /// The binarized `mask_<name>` image, when a threshold was given.
    pub mask: Option<ImageHandle>,
    /// Non-zero voxels of the mask.
    pub voxels: Option<u64>,
}

pub type RoiOutcome = Result<TransformedRoi>;

/// Notified when a thresholded ROI ends up empty, which usually means the
/// transform produced a degenerate result. An empty ROI is still a success.
pub trait EmptyRoiCallback {
    fn on_empty_roi(&self, roi: &TransformedRoi);
}

impl<F> EmptyRoiCallback for F
where
    F: Fn(&TransformedRoi),
{
    fn on_empty_roi(&self, roi: &TransformedRoi) {
        self(roi)
    }
}

/// Callback that only logs a warning. Used when the caller gives none.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEmptyRoi;

impl EmptyRoiCallback for LogEmptyRoi {
    fn on_empty_roi(&self, roi: &TransformedRoi) {
        tracing::warn!(output = %roi.output, "transformed ROI is empty after thresholding");
    }
}

/// Optional settings of a `transform_roi` call.
#[derive(Default)]
pub struct RoiOptions<'a> {
    /// Defaults to `roi/<dest space>` of the subject.
    pub output_dir: Option<PathBuf>,
    /// Output name for a single ROI, or prefix for several. Defaults to `<name>_<dest space>`.
    pub output_name: Option<String>,
    /// Binarize the output at this value into a `mask_<name>` sibling. Ignored unless positive.
    pub threshold: Option<f64>,
    pub on_empty: Option<&'a dyn EmptyRoiCallback>,
}


pub struct RoiTransformer<'a, E: EnsureTransform> {
    ctx: &'a SubjectContext,
    runner: &'a dyn ToolRunner,
    transforms: &'a E,
    interpolation: Interpolation,
}

impl<'a> RoiTransformer<'a, TransformComputer<'a>> {
    /// A transformer using the computer's subject, runner and interpolation.
    pub fn from_computer(computer: &'a TransformComputer<'a>) -> Self {
        RoiTransformer::new(
            computer.context(),
            computer.runner(),
            computer,
            computer.config().interpolation,
        )
    }
}

impl<'a, E: EnsureTransform> RoiTransformer<'a, E> {
    pub fn new(
        ctx: &'a SubjectContext,
        runner: &'a dyn ToolRunner,
        transforms: &'a E,
        interpolation: Interpolation,
    ) -> Self {
        RoiTransformer { ctx, runner, transforms, interpolation }
    }

    /// Transform every ROI of `rois` along the pair named by `pair_key` (e.g. `"hr2std"`).
    ///
    /// Each ROI succeeds or fails on its own; the outcomes are returned in input
    /// order. The transform is guaranteed once per call. Only an unknown key or a
    /// `RecipeLoop` abort the whole batch. An ROI whose output name was already
    /// taken by an earlier ROI of the batch fails with `DuplicateOutput`.
    pub fn transform_roi<S: AsRef<str>>(
        &self,
        pair_key: &str,
        path_type: PathType,
        rois: &[S],
        linear: bool,
        options: &RoiOptions<'_>,
    ) -> Result<Vec<RoiOutcome>> {
        let pair: SpacePair = pair_key.parse()?;
        let mut transform: Option<Result<Artifact>> = None;
        let request = TransformRequest::new(pair.source, pair.dest, linear);
        let mut claimed = HashSet::new();
        let mut outcomes = Vec::with_capacity(rois.len());

        for roi in rois {
            let input = self.input_path(pair, path_type, roi.as_ref());
            let output = self.output_image(pair, &input, rois.len(), options);
            let outcome = if !input.exists() || claimed.insert(output.stem_path()) {
                self.transform_one(request, input, output, options, &mut transform)
                    .map_err(|err| err.for_request(self.ctx.label(), request))
            } else {
                Err(TransformError::DuplicateOutput {
                    subject: self.ctx.label().to_string(),
                    request,
                    path: output.path().to_path_buf(),
                })
            };
            if let Err(err) = &outcome {
                if let TransformError::RecipeLoop { .. } = err {
                    return Err(err.clone());
                }
                tracing::error!(subject = self.ctx.label(), %pair, roi = roi.as_ref(), error = %err, "ROI not transformed");
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Absolute path of a caller supplied ROI.
    pub fn input_path(&self, pair: SpacePair, path_type: PathType, roi: &str) -> ImageHandle {
        match path_type {
            PathType::Absolute => ImageHandle::new(roi),
            PathType::RelativeToSubjectRoot => ImageHandle::new(self.ctx.root().join(roi)),
            PathType::NamedInSourceSpaceFolder => ImageHandle::new(self.ctx.roi_dir(pair.source).join(roi)),
        }
    }

    fn transform_one(
        &self,
        request: TransformRequest,
        input: ImageHandle,
        output: ImageHandle,
        options: &RoiOptions<'_>,
        transform: &mut Option<Result<Artifact>>,
    ) -> RoiOutcome {
        let pair = request.pair;
        if !input.exists() {
            return Err(TransformError::InputNotFound {
                subject: self.ctx.label().to_string(),
                request,
                path: input.path().to_path_buf(),
            });
        }

        let artifact = transform
            .get_or_insert_with(|| self.transforms.ensure(pair.source, pair.dest, request.linear))
            .clone()?;

        let reference = self.ctx.representative_image(pair.dest);
        if !reference.exists() {
            return Err(TransformError::MissingPrerequisite {
                subject: self.ctx.label().to_string(),
                request: artifact.request,
                path: reference.path().to_path_buf(),
            });
        }

        let command = if artifact.is_warp() {
            ToolCommand::new("applywarp")
                .arg("-i")
                .image("", &input)
                .arg("-r")
                .image("", &reference)
                .output("-o", OutputKind::Image, output.path())
                .arg("-w")
                .image("", &artifact.warp())
                .arg(format!("--interp={}", self.interpolation.applywarp_name()))
        } else {
            ToolCommand::new("flirt")
                .arg("-in")
                .image("", &input)
                .arg("-ref")
                .image("", &reference)
                .output("-out", OutputKind::Image, output.path())
                .arg("-applyxfm")
                .arg("-init")
                .path("", &artifact.path)
                .args(vec!["-interp", self.interpolation.fsl_name()])
        };
        execute(self.runner, &command)?;
        tracing::info!(subject = self.ctx.label(), %pair, output = %output, "ROI transformed");

        let mut result = TransformedRoi {
            input,
            output,
            mask: None,
            voxels: None,
        };

        if let Some(threshold) = options.threshold.filter(|t| *t > 0.0) {
            let mask = result.output.sibling(&format!("mask_{}", result.output.name()));
            let binarize = ToolCommand::new("fslmaths")
                .image("", &result.output)
                .arg("-thr")
                .arg(threshold.to_string())
                .arg("-bin")
                .output("", OutputKind::Image, mask.path());
            execute(self.runner, &binarize)?;

            let voxels = self.count_voxels(&mask)?;
            result.mask = Some(mask);
            result.voxels = Some(voxels);
            if voxels == 0 {
                match options.on_empty {
                    Some(callback) => callback.on_empty_roi(&result),
                    None => LogEmptyRoi.on_empty_roi(&result),
                }
            }
        }
        Ok(result)
    }

    fn output_image(
        &self,
        pair: SpacePair,
        input: &ImageHandle,
        batch_size: usize,
        options: &RoiOptions<'_>,
    ) -> ImageHandle {
        let dir = options
            .output_dir
            .clone()
            .unwrap_or_else(|| self.ctx.roi_dir(pair.dest));
        let name = match &options.output_name {
            Some(name) if batch_size == 1 => name.clone(),
            Some(prefix) => format!("{}_{}", prefix, input.name()),
            None => format!("{}_{}", input.name(), pair.dest),
        };
        ImageHandle::new(dir.join(name))
    }

    /// Non-zero voxel count, the first number `fslstats -V` prints.
    fn count_voxels(&self, mask: &ImageHandle) -> Result<u64> {
        let command = ToolCommand::new("fslstats").image("", mask).arg("-V");
        let stdout = execute(self.runner, &command)?;
        stdout
            .split_whitespace()
            .next()
            .and_then(|tok| tok.parse::<f64>().ok())
            .map(|v| v as u64)
            .ok_or_else(|| {
                TransformError::tool_failure(
                    command.command_line(),
                    String::from("exited successfully"),
                    format!("unexpected output '{}'", stdout.trim()),
                )
            })
    }
}
