#![allow(dead_code)]

use std::fs;
use std::path::Path;

use ndarray::Array2;
use neurotransforms::image::format_affine;
use neurotransforms::util::write_empty_nifti;
use neurotransforms::{ImageHandle, ImageRole, Space, SubjectContext, TransformConfig};
use tempfile::TempDir;

pub const SUBJECT: &str = "sub01";

/// A throwaway FSL installation and subject tree.
pub struct Subject {
    pub dir: TempDir,
    pub config: TransformConfig,
    pub ctx: SubjectContext,
}

impl Subject {
    /// Remove every computed transform and transformed ROI.
    pub fn clear_artifacts(&self) {
        let roi = self.ctx.root().join("roi");
        if roi.exists() {
            fs::remove_dir_all(roi).unwrap();
        }
    }

    /// Place an ROI named `name` in `roi/<space>`.
    pub fn add_roi(&self, space: Space, name: &str) -> ImageHandle {
        let img = ImageHandle::new(self.ctx.roi_dir(space).join(name));
        touch(&img);
        img
    }
}

pub fn touch(img: &ImageHandle) {
    let stem = img.stem_path();
    fs::create_dir_all(stem.parent().unwrap()).unwrap();
    let mut file = stem.into_os_string();
    file.push(".nii.gz");
    write_empty_nifti(file).unwrap();
}

fn fsl_install(dir: &Path) -> TransformConfig {
    let config = TransformConfig {
        fsl_dir: dir.join("fsl"),
        template: None,
        ..TransformConfig::default()
    };
    let t = config.templates();
    for p in [&t.std_head, &t.std_brain, &t.std_mask_dil, &t.std4_head, &t.std4_brain, &t.std4_mask_dil].iter() {
        touch(&ImageHandle::new(*p));
    }
    let ident = config.identity_matrix();
    fs::create_dir_all(ident.parent().unwrap()).unwrap();
    fs::write(ident, format_affine(&Array2::<f64>::eye(4))).unwrap();
    config
}

/// A subject with HR and the given optional spaces, every image in place.
pub fn subject_with(spaces: &[Space]) -> Subject {
    let dir = tempfile::tempdir().unwrap();
    let config = fsl_install(dir.path());
    let subjects = dir.path().join("subjects");

    let hr_only_root = subjects.join(SUBJECT).join("s1");
    touch(&ImageHandle::new(hr_only_root.join("mpr").join(format!("{}-t1", SUBJECT))));
    let bare = SubjectContext::new(SUBJECT, 1, &subjects, &config.templates()).unwrap();
    for space in spaces {
        touch(&bare.defining_image(*space));
    }

    let ctx = SubjectContext::new(SUBJECT, 1, &subjects, &config.templates()).unwrap();
    for space in ctx.spaces() {
        for role in [ImageRole::Head, ImageRole::Brain, ImageRole::MaskDil].iter() {
            let img = ctx.image(space, *role);
            if !img.exists() {
                touch(&img);
            }
        }
    }
    Subject { dir, config, ctx }
}
