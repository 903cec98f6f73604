mod common;

use common::subject_with;
use neurotransforms::{
    EnsureTransform, RecordingRunner, Space, ToolCommand, TransformComputer, TransformError,
    TransformRequest,
};

fn flag_values(cmd: &ToolCommand, flag: &str) -> Vec<String> {
    let argv = cmd.argv();
    argv.iter()
        .position(|a| a == flag)
        .map(|idx| argv[idx + 1..idx + 3].to_vec())
        .unwrap_or_default()
}

#[test]
fn a_second_ensure_is_served_from_disk() {
    let s = subject_with(&[]);
    let runner = RecordingRunner::new();
    let computer = TransformComputer::new(&s.ctx, &runner, &s.config);

    let first = computer.ensure(Space::Hr, Space::Std, true).unwrap();
    let second = computer.ensure(Space::Hr, Space::Std, true).unwrap();

    assert_eq!(first, second);
    assert_eq!(1, runner.call_count());
    assert!(first.path.ends_with("roi/reg_std/hr2std.mat"));
    assert!(first.is_complete());
}

#[test]
fn linear_registration_uses_the_fixed_parameter_sets() {
    let s = subject_with(&[Space::Dti, Space::T2]);
    let runner = RecordingRunner::new();
    let computer = TransformComputer::new(&s.ctx, &runner, &s.config);

    computer.ensure(Space::Hr, Space::Std, true).unwrap();
    computer.ensure(Space::Dti, Space::T2, true).unwrap();
    let calls = runner.calls();

    let within = &calls[0];
    assert_eq!("flirt", within.program());
    assert_eq!(Some(String::from("corratio")), within.value_of("-cost"));
    assert_eq!(Some(String::from("12")), within.value_of("-dof"));
    for axis in ["-searchrx", "-searchry", "-searchrz"].iter() {
        assert_eq!(vec!["-90", "90"], flag_values(within, axis));
    }
    assert_eq!(Some(String::from("trilinear")), within.value_of("-interp"));

    let cross = &calls[1];
    assert_eq!(Some(String::from("normmi")), cross.value_of("-cost"));
    assert_eq!(Some(String::from("7")), cross.value_of("-dof"));
    assert_eq!(vec!["-90", "90"], flag_values(cross, "-searchrz"));
}

#[test]
fn epi_to_hr_registration_is_rigid() {
    let s = subject_with(&[Space::Rs, Space::Fmri]);
    let runner = RecordingRunner::new();
    let computer = TransformComputer::new(&s.ctx, &runner, &s.config);

    computer.ensure(Space::Rs, Space::Hr, true).unwrap();
    computer.ensure(Space::Fmri, Space::Hr, false).unwrap();
    let calls = runner.calls();

    assert_eq!(2, calls.len());
    for call in calls.iter() {
        assert_eq!("flirt", call.program());
        assert_eq!(Some(String::from("corratio")), call.value_of("-cost"));
        assert_eq!(Some(String::from("6")), call.value_of("-dof"));
    }
}

#[test]
fn non_linear_registration_is_initialised_with_the_affine() {
    let s = subject_with(&[]);
    let runner = RecordingRunner::new();
    let computer = TransformComputer::new(&s.ctx, &runner, &s.config);

    let warp = computer.ensure(Space::Hr, Space::Std, false).unwrap();
    assert!(warp.path.ends_with("roi/reg_std/hr2std_warp"));
    assert!(warp.is_complete());
    assert_eq!(vec!["flirt", "fnirt"], runner.programs());

    let fnirt = &runner.calls()[1];
    let argv = fnirt.argv();
    let aff = s.ctx.reg_dir(Space::Std).join("hr2std.mat");
    assert!(argv.contains(&format!("--aff={}", aff.display())));
    assert!(argv.contains(&format!("--refmask={}", s.config.templates().std_mask_dil.display())));
    assert!(argv.contains(&String::from("--config=T1_2_MNI152_2mm")));
}

#[test]
fn table_fallbacks_issue_the_linear_commands() {
    use Space::*;
    let s = subject_with(&[Rs, Fmri, T2]);
    let pairs = [(Rs, Hr), (Hr, Rs), (Fmri, Hr), (Hr, Fmri), (T2, Hr), (Hr, T2), (Std, Std4), (Std4, Std)];

    for (src, dst) in pairs.iter() {
        s.clear_artifacts();
        let non_linear = RecordingRunner::new();
        let a = TransformComputer::new(&s.ctx, &non_linear, &s.config)
            .ensure(*src, *dst, false)
            .unwrap();

        s.clear_artifacts();
        let linear = RecordingRunner::new();
        let b = TransformComputer::new(&s.ctx, &linear, &s.config)
            .ensure(*src, *dst, true)
            .unwrap();

        assert_eq!(b.path, a.path, "{:?} -> {:?}", src, dst);
        assert!(a.request.linear);
        assert_eq!(linear.calls(), non_linear.calls(), "{:?} -> {:?}", src, dst);
        assert!(!non_linear.programs().contains(&String::from("fnirt")));
    }
}

#[test]
fn rs_to_fmri_is_concatenated_through_hr() {
    let s = subject_with(&[Space::Rs, Space::Fmri]);
    let runner = RecordingRunner::new();
    let computer = TransformComputer::new(&s.ctx, &runner, &s.config);

    let artifact = computer.ensure(Space::Rs, Space::Fmri, true).unwrap();
    assert!(artifact.path.ends_with("roi/reg_fmri/rs2fmri.mat"));

    let calls = runner.calls();
    assert_eq!(vec!["flirt", "flirt", "convert_xfm", "convert_xfm"], runner.programs());
    // RS -> HR first
    let rs_func = s.ctx.representative_image(Space::Rs).stem_path();
    assert_eq!(Some(rs_func.display().to_string()), calls[0].value_of("-in"));
    // then HR -> FMRI, by inverting FMRI -> HR
    let fmri_func = s.ctx.representative_image(Space::Fmri).stem_path();
    assert_eq!(Some(fmri_func.display().to_string()), calls[1].value_of("-in"));
    assert!(calls[2].has_arg("-inverse"));
    // and the concatenation last, HR -> FMRI applied after RS -> HR
    let concat = &calls[3];
    assert!(concat.has_arg("-concat"));
    let argv = concat.argv();
    let n = argv.len();
    assert!(argv[n - 2].ends_with("reg_fmri/hr2fmri.mat"));
    assert!(argv[n - 1].ends_with("reg_hr/rs2hr.mat"));
}

#[test]
fn shared_prerequisites_are_computed_once() {
    let s = subject_with(&[Space::Rs, Space::Fmri]);
    let runner = RecordingRunner::new();
    let computer = TransformComputer::new(&s.ctx, &runner, &s.config);

    computer.ensure(Space::Rs, Space::Std, true).unwrap();
    computer.ensure(Space::Fmri, Space::Std, true).unwrap();

    let std_brain = s.config.templates().std_brain.display().to_string();
    let to_std = runner
        .calls()
        .iter()
        .filter(|c| c.program() == "flirt" && c.value_of("-ref") == Some(std_brain.clone()))
        .count();
    assert_eq!(1, to_std);
}

#[test]
fn missing_modality_never_reaches_the_runner() {
    let s = subject_with(&[Space::T2]);
    let runner = RecordingRunner::new();
    let computer = TransformComputer::new(&s.ctx, &runner, &s.config);

    match computer.ensure(Space::Dti, Space::Hr, true) {
        Err(TransformError::MissingModality { space, subject, .. }) => {
            assert_eq!(Space::Dti, space);
            assert_eq!("sub01", subject);
        }
        other => panic!("expected MissingModality, got {:?}", other),
    }
    assert_eq!(0, runner.call_count());
}

#[test]
fn missing_representative_image_is_a_prerequisite_error() {
    let s = subject_with(&[Space::Dti]);
    s.ctx.representative_image(Space::Dti).remove().unwrap();
    let runner = RecordingRunner::new();
    let computer = TransformComputer::new(&s.ctx, &runner, &s.config);

    match computer.ensure(Space::Dti, Space::Hr, true) {
        Err(TransformError::MissingPrerequisite { path, .. }) => {
            assert!(path.ends_with("dti/sub01-dti_nodiff_brain"));
        }
        other => panic!("expected MissingPrerequisite, got {:?}", other),
    }
    assert_eq!(0, runner.call_count());
}

#[test]
fn dti_to_hr_warps_through_t2() {
    let s = subject_with(&[Space::Dti, Space::T2]);
    let runner = RecordingRunner::new();
    let computer = TransformComputer::new(&s.ctx, &runner, &s.config);

    let artifact = computer.ensure(Space::Dti, Space::Hr, false).unwrap();
    assert!(artifact.path.ends_with("roi/reg_hr/dti2hr_warp"));
    assert!(artifact.is_complete());
    assert_eq!(vec!["flirt", "fnirt", "flirt", "convertwarp"], runner.programs());

    let calls = runner.calls();
    // DTI -> T2 non-linear, the only registration that is warped
    assert!(calls[1].argv().iter().any(|a| a.starts_with("--cout=") && a.contains("reg_t2/dti2t2_warp")));
    // T2 -> HR linear
    let t2_brain = s.ctx.representative_image(Space::T2).stem_path();
    assert_eq!(Some(t2_brain.display().to_string()), calls[2].value_of("-in"));
    let argv = calls[3].argv();
    assert!(argv.iter().any(|a| a.starts_with("--warp1=") && a.ends_with("reg_t2/dti2t2_warp")));
    assert!(argv.iter().any(|a| a.starts_with("--postmat=") && a.ends_with("reg_hr/t22hr.mat")));
}

#[test]
fn dti_to_hr_without_t2_falls_back_to_linear() {
    let s = subject_with(&[Space::Dti]);
    let runner = RecordingRunner::new();
    let computer = TransformComputer::new(&s.ctx, &runner, &s.config);

    let artifact = computer.ensure(Space::Dti, Space::Hr, false).unwrap();
    assert!(artifact.request.linear);
    assert!(artifact.path.ends_with("roi/reg_hr/dti2hr.mat"));
    assert_eq!(vec!["flirt"], runner.programs());
}

#[test]
fn std_to_std4_is_a_single_isotropic_resample() {
    let s = subject_with(&[]);
    let runner = RecordingRunner::new();
    let computer = TransformComputer::new(&s.ctx, &runner, &s.config);

    let artifact = computer.ensure(Space::Std, Space::Std4, false).unwrap();
    assert!(artifact.path.ends_with("roi/reg_std4/std2std4.mat"));
    assert_eq!(vec!["flirt"], runner.programs());
    assert_eq!(Some(String::from("4")), runner.calls()[0].value_of("-applyisoxfm"));
}

#[test]
fn warps_are_inverted_against_the_destination_geometry() {
    let s = subject_with(&[]);
    let runner = RecordingRunner::new();
    let computer = TransformComputer::new(&s.ctx, &runner, &s.config);

    computer.ensure(Space::Std, Space::Hr, false).unwrap();
    let calls = runner.calls();
    let invwarp = calls.last().unwrap();
    assert_eq!("invwarp", invwarp.program());
    let hr_brain = s.ctx.representative_image(Space::Hr).stem_path();
    assert!(invwarp.has_arg(&format!("--ref={}", hr_brain.display())));
}

#[test]
fn a_failed_registration_leaves_no_artifact() {
    let s = subject_with(&[]);
    let runner = RecordingRunner::new().fail("fnirt");
    let computer = TransformComputer::new(&s.ctx, &runner, &s.config);

    let err = computer.ensure(Space::Hr, Space::Std, false).unwrap_err();
    match &err {
        TransformError::ExternalToolFailure { subject, request, .. } => {
            assert_eq!(common::SUBJECT, subject);
            assert_eq!(Some(TransformRequest::new(Space::Hr, Space::Std, false)), *request);
        }
        other => panic!("unexpected error {:?}", other),
    }

    let left: Vec<String> = std::fs::read_dir(s.ctx.reg_dir(Space::Std))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(vec![String::from("hr2std.mat")], left);

    // a later run recomputes only the warp
    let retry = RecordingRunner::new();
    TransformComputer::new(&s.ctx, &retry, &s.config)
        .ensure(Space::Hr, Space::Std, false)
        .unwrap();
    assert_eq!(vec!["fnirt"], retry.programs());
}

#[test]
fn a_tool_that_writes_no_output_is_not_cached() {
    let s = subject_with(&[]);
    let runner = RecordingRunner::new().without_outputs("flirt");
    let computer = TransformComputer::new(&s.ctx, &runner, &s.config);

    assert!(computer.ensure(Space::Hr, Space::Std, true).is_err());
    assert!(computer.ensure(Space::Hr, Space::Std, true).is_err());
    assert_eq!(2, runner.call_count());
}

#[test]
fn epi_to_dti_is_unsupported() {
    let s = subject_with(&[Space::Rs, Space::Dti]);
    let runner = RecordingRunner::new();
    let computer = TransformComputer::new(&s.ctx, &runner, &s.config);

    let err = computer.ensure(Space::Rs, Space::Dti, true).unwrap_err();
    assert!(matches!(err, TransformError::UnsupportedPair { .. }));
    assert_eq!(0, runner.call_count());
}
