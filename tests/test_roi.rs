mod common;

use std::cell::Cell;

use common::subject_with;
use neurotransforms::catalog::artifact_path;
use neurotransforms::{
    Artifact, EnsureTransform, ImageHandle, Interpolation, PathType, RecordingRunner, RoiOptions, RoiTransformer,
    Space, TransformComputer, TransformError, TransformRequest, TransformedRoi,
};

/// Hands out a fixed artifact and counts how often it was asked.
struct StubTransforms {
    answer: Result<Artifact, TransformError>,
    asked: Cell<usize>,
}

impl EnsureTransform for StubTransforms {
    fn ensure(&self, _source: Space, _dest: Space, _linear: bool) -> neurotransforms::Result<Artifact> {
        self.asked.set(self.asked.get() + 1);
        self.answer.clone()
    }
}

fn hr2std_matrix(s: &common::Subject) -> StubTransforms {
    let request = TransformRequest::new(Space::Hr, Space::Std, true);
    StubTransforms {
        answer: Ok(Artifact {
            request,
            path: artifact_path(&s.ctx, &request),
        }),
        asked: Cell::new(0),
    }
}

#[test]
fn one_missing_roi_does_not_abort_the_batch() {
    let s = subject_with(&[]);
    s.add_roi(Space::Hr, "amygdala");
    s.add_roi(Space::Hr, "thalamus");
    let runner = RecordingRunner::new();
    let stub = hr2std_matrix(&s);
    let transformer = RoiTransformer::new(&s.ctx, &runner, &stub, Interpolation::Trilinear);

    let outcomes = transformer
        .transform_roi(
            "hr2std",
            PathType::NamedInSourceSpaceFolder,
            &["amygdala", "hippocampus", "thalamus"],
            true,
            &RoiOptions::default(),
        )
        .unwrap();

    assert_eq!(3, outcomes.len());
    let first = outcomes[0].as_ref().unwrap();
    assert!(first.output.path().ends_with("roi/std/amygdala_std"));
    assert!(first.output.is_complete());
    assert!(matches!(outcomes[1], Err(TransformError::InputNotFound { .. })));
    assert!(outcomes[2].as_ref().unwrap().output.path().ends_with("roi/std/thalamus_std"));
    assert_eq!(1, stub.asked.get());
    assert_eq!(vec!["flirt", "flirt"], runner.programs());
    assert!(runner.calls()[0].has_arg("-applyxfm"));
}

#[test]
fn empty_masks_are_reported_but_succeed() {
    let s = subject_with(&[]);
    s.add_roi(Space::Hr, "amygdala");
    let runner = RecordingRunner::new().respond("fslstats", "0 0.000000\n");
    let stub = hr2std_matrix(&s);
    let transformer = RoiTransformer::new(&s.ctx, &runner, &stub, Interpolation::Trilinear);

    let empties = Cell::new(0);
    let on_empty = |roi: &TransformedRoi| {
        assert_eq!(Some(0), roi.voxels);
        empties.set(empties.get() + 1);
    };
    let options = RoiOptions {
        threshold: Some(0.2),
        on_empty: Some(&on_empty),
        ..RoiOptions::default()
    };

    let outcomes = transformer
        .transform_roi("hr2std", PathType::NamedInSourceSpaceFolder, &["amygdala"], true, &options)
        .unwrap();

    assert_eq!(1, empties.get());
    let roi = outcomes[0].as_ref().unwrap();
    let mask = roi.mask.as_ref().unwrap();
    assert_eq!("mask_amygdala_std", mask.name());
    assert!(mask.is_complete());
    assert_eq!(vec!["flirt", "fslmaths", "fslstats"], runner.programs());
    assert_eq!(Some(String::from("0.2")), runner.calls()[1].value_of("-thr"));
}

#[test]
fn non_empty_masks_are_quiet() {
    let s = subject_with(&[]);
    s.add_roi(Space::Hr, "amygdala");
    let runner = RecordingRunner::new().respond("fslstats", "125 1000.000000\n");
    let stub = hr2std_matrix(&s);
    let transformer = RoiTransformer::new(&s.ctx, &runner, &stub, Interpolation::Trilinear);

    let empties = Cell::new(0);
    let on_empty = |_: &TransformedRoi| empties.set(empties.get() + 1);
    let options = RoiOptions {
        threshold: Some(0.5),
        on_empty: Some(&on_empty),
        ..RoiOptions::default()
    };
    let outcomes = transformer
        .transform_roi("hr2std", PathType::NamedInSourceSpaceFolder, &["amygdala"], true, &options)
        .unwrap();

    assert_eq!(0, empties.get());
    assert_eq!(Some(125), outcomes[0].as_ref().unwrap().voxels);
}

#[test]
fn a_failed_transform_is_reported_for_each_roi_and_asked_once() {
    let s = subject_with(&[]);
    s.add_roi(Space::Hr, "a");
    s.add_roi(Space::Hr, "b");
    let runner = RecordingRunner::new();
    let stub = StubTransforms {
        answer: Err(TransformError::MissingModality {
            subject: String::from("sub01"),
            space: Space::Dti,
            request: TransformRequest::new(Space::Hr, Space::Dti, true),
        }),
        asked: Cell::new(0),
    };
    let transformer = RoiTransformer::new(&s.ctx, &runner, &stub, Interpolation::Trilinear);

    let outcomes = transformer
        .transform_roi("hr2dti", PathType::NamedInSourceSpaceFolder, &["a", "b"], true, &RoiOptions::default())
        .unwrap();

    assert!(outcomes.iter().all(|o| matches!(o, Err(TransformError::MissingModality { .. }))));
    assert_eq!(1, stub.asked.get());
    assert_eq!(0, runner.call_count());
}

#[test]
fn warps_are_applied_with_applywarp() {
    let s = subject_with(&[]);
    let roi = s.add_roi(Space::Hr, "putamen");
    let runner = RecordingRunner::new();
    let computer = TransformComputer::new(&s.ctx, &runner, &s.config);
    let transformer = RoiTransformer::from_computer(&computer);
    let out_dir = s.dir.path().join("group");

    let options = RoiOptions {
        output_dir: Some(out_dir.clone()),
        output_name: Some(String::from("putamen_mni")),
        ..RoiOptions::default()
    };
    let abs = roi.stem_path().display().to_string();
    let outcomes = transformer
        .transform_roi("hr2std", PathType::Absolute, &[abs], false, &options)
        .unwrap();

    let result = outcomes[0].as_ref().unwrap();
    assert_eq!(out_dir.join("putamen_mni"), result.output.stem_path());
    assert!(result.mask.is_none());
    assert_eq!(vec!["flirt", "fnirt", "applywarp"], runner.programs());
    let apply = runner.calls().pop().unwrap();
    assert_eq!(Some(String::from("--interp=trilinear")), apply.argv().last().cloned());
}

#[test]
fn an_output_name_prefixes_every_roi_of_a_batch() {
    let s = subject_with(&[]);
    s.add_roi(Space::Hr, "left");
    s.add_roi(Space::Hr, "right");
    let runner = RecordingRunner::new();
    let stub = hr2std_matrix(&s);
    let transformer = RoiTransformer::new(&s.ctx, &runner, &stub, Interpolation::Trilinear);

    let options = RoiOptions {
        output_name: Some(String::from("hemi")),
        ..RoiOptions::default()
    };
    let outcomes = transformer
        .transform_roi("hr2std", PathType::RelativeToSubjectRoot, &["roi/hr/left", "roi/hr/right"], true, &options)
        .unwrap();

    let names: Vec<String> = outcomes.iter().map(|o| o.as_ref().unwrap().output.name()).collect();
    assert_eq!(vec!["hemi_left", "hemi_right"], names);
}

#[test]
fn unknown_pair_keys_fail_the_call() {
    let s = subject_with(&[]);
    let runner = RecordingRunner::new();
    let stub = hr2std_matrix(&s);
    let transformer = RoiTransformer::new(&s.ctx, &runner, &stub, Interpolation::Trilinear);

    let err = transformer
        .transform_roi("hr2mni", PathType::Absolute, &["x"], true, &RoiOptions::default())
        .unwrap_err();
    assert!(matches!(err, TransformError::UnknownSpace { .. }));
}

#[test]
fn rois_sharing_an_output_name_are_not_overwritten() {
    let s = subject_with(&[]);
    let first = s.add_roi(Space::Hr, "amygdala");
    let second = ImageHandle::new(s.dir.path().join("atlas").join("amygdala"));
    common::touch(&second);
    let runner = RecordingRunner::new();
    let stub = hr2std_matrix(&s);
    let transformer = RoiTransformer::new(&s.ctx, &runner, &stub, Interpolation::Trilinear);

    let rois = vec![
        first.path().to_string_lossy().into_owned(),
        second.path().to_string_lossy().into_owned(),
    ];
    let outcomes = transformer
        .transform_roi("hr2std", PathType::Absolute, &rois, true, &RoiOptions::default())
        .unwrap();

    assert!(outcomes[0].as_ref().unwrap().output.path().ends_with("roi/std/amygdala_std"));
    match &outcomes[1] {
        Err(TransformError::DuplicateOutput { path, request, .. }) => {
            assert!(path.ends_with("roi/std/amygdala_std"));
            assert_eq!(TransformRequest::new(Space::Hr, Space::Std, true), *request);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(vec!["flirt"], runner.programs());
}

#[test]
fn failures_name_the_subject_and_the_transform() {
    let s = subject_with(&[]);
    s.add_roi(Space::Hr, "amygdala");
    let runner = RecordingRunner::new().fail("flirt");
    let stub = hr2std_matrix(&s);
    let transformer = RoiTransformer::new(&s.ctx, &runner, &stub, Interpolation::Trilinear);

    let outcomes = transformer
        .transform_roi(
            "hr2std",
            PathType::NamedInSourceSpaceFolder,
            &["amygdala", "putamen"],
            true,
            &RoiOptions::default(),
        )
        .unwrap();

    let expected = TransformRequest::new(Space::Hr, Space::Std, true);
    match &outcomes[0] {
        Err(TransformError::ExternalToolFailure { subject, request, .. }) => {
            assert_eq!(common::SUBJECT, subject);
            assert_eq!(Some(expected), *request);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    match &outcomes[1] {
        Err(TransformError::InputNotFound { subject, request, .. }) => {
            assert_eq!(common::SUBJECT, subject);
            assert_eq!(expected, *request);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}
