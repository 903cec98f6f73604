//! The read-only view of one subject session that the transform engine consumes.

use std::path::{Path, PathBuf};

use crate::config::TemplateConfig;
use crate::error::{Result, TransformError};
use crate::image::ImageHandle;
use crate::space::Space;

/// Which image of a space to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageRole {
    /// Whole-head image, the moving/fixed image of a non-linear registration.
    Head,
    /// Skull-stripped image, the representative image of linear registrations.
    Brain,
    /// Dilated brain mask, the reference mask of a non-linear registration.
    MaskDil,
}

/// An immutable (subject, session) value. The other session of the same
/// subject is a second instance, see [`SubjectContext::for_session`].
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectContext {
    label: String,
    session: u32,
    subjects_dir: PathBuf,
    root: PathBuf,
    templates: TemplateConfig,
    present: [bool; 7],
}

impl SubjectContext {
    /// Build the context of `<subjects_dir>/<label>/s<session>`.
    ///
    /// Which optional modalities exist is decided here, once, from their
    /// defining images. The T1 and both template brains must exist.
    pub fn new<P: AsRef<Path>>(
        label: &str,
        session: u32,
        subjects_dir: P,
        templates: &TemplateConfig,
    ) -> Result<SubjectContext> {
        let subjects_dir = subjects_dir.as_ref().to_path_buf();
        let root = subjects_dir.join(label).join(format!("s{}", session));
        let mut ctx = SubjectContext {
            label: label.to_string(),
            session,
            subjects_dir,
            root,
            templates: templates.clone(),
            present: [true; 7],
        };

        for space in [Space::Hr, Space::Std, Space::Std4].iter() {
            let img = ctx.defining_image(*space);
            if !img.exists() {
                return Err(TransformError::IncompleteSubject {
                    subject: ctx.label.clone(),
                    path: img.path().to_path_buf(),
                });
            }
        }
        for space in Space::ALL.iter().filter(|s| s.is_optional()) {
            ctx.present[index(*space)] = ctx.defining_image(*space).exists();
        }

        tracing::debug!(
            subject = %ctx.label,
            session,
            spaces = ?ctx.spaces(),
            "subject context built"
        );
        Ok(ctx)
    }

    /// The same subject at another session.
    pub fn for_session(&self, session: u32) -> Result<SubjectContext> {
        SubjectContext::new(&self.label, session, &self.subjects_dir, &self.templates)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn session(&self) -> u32 {
        self.session
    }

    /// `<subjects_dir>/<label>/s<session>`.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn templates(&self) -> &TemplateConfig {
        &self.templates
    }

    pub fn has_space(&self, space: Space) -> bool {
        self.present[index(space)]
    }

    /// The spaces this session has, in catalog order.
    pub fn spaces(&self) -> Vec<Space> {
        Space::ALL.iter().copied().filter(|s| self.has_space(*s)).collect()
    }

    /// The image whose presence means the modality was acquired.
    pub fn defining_image(&self, space: Space) -> ImageHandle {
        let l = &self.label;
        match space {
            Space::Hr => self.subject_image(&["mpr", &format!("{}-t1", l)]),
            Space::Rs => self.subject_image(&["resting", &format!("{}-rs", l)]),
            Space::Fmri => self.subject_image(&["fmri", &format!("{}-fmri", l)]),
            Space::Dti => self.subject_image(&["dti", &format!("{}-dti", l)]),
            Space::T2 => self.subject_image(&["t2", &format!("{}-t2", l)]),
            Space::Std | Space::Std4 => self.image(space, ImageRole::Brain),
        }
    }

    /// The image used as moving or fixed image when registering `space` directly.
    pub fn representative_image(&self, space: Space) -> ImageHandle {
        self.image(space, ImageRole::Brain)
    }

    pub fn image(&self, space: Space, role: ImageRole) -> ImageHandle {
        let l = &self.label;
        let t = &self.templates;
        match (space, role) {
            (Space::Hr, ImageRole::Head) => self.defining_image(Space::Hr),
            (Space::Hr, ImageRole::Brain) => self.subject_image(&["mpr", &format!("{}-t1_brain", l)]),
            (Space::Hr, ImageRole::MaskDil) => {
                self.subject_image(&["mpr", &format!("{}-t1_brain_mask_dil", l)])
            }
            (Space::Rs, ImageRole::MaskDil) => {
                self.subject_image(&["resting", "reg", "example_func_mask_dil"])
            }
            (Space::Rs, _) => self.subject_image(&["resting", "reg", "example_func"]),
            (Space::Fmri, ImageRole::MaskDil) => {
                self.subject_image(&["fmri", "reg", "example_func_mask_dil"])
            }
            (Space::Fmri, _) => self.subject_image(&["fmri", "reg", "example_func"]),
            (Space::Dti, ImageRole::Head) => self.subject_image(&["dti", &format!("{}-dti_nodiff", l)]),
            (Space::Dti, ImageRole::Brain) => {
                self.subject_image(&["dti", &format!("{}-dti_nodiff_brain", l)])
            }
            (Space::Dti, ImageRole::MaskDil) => {
                self.subject_image(&["dti", &format!("{}-dti_nodiff_brain_mask_dil", l)])
            }
            (Space::T2, ImageRole::Head) => self.defining_image(Space::T2),
            (Space::T2, ImageRole::Brain) => self.subject_image(&["t2", &format!("{}-t2_brain", l)]),
            (Space::T2, ImageRole::MaskDil) => {
                self.subject_image(&["t2", &format!("{}-t2_brain_mask_dil", l)])
            }
            (Space::Std, ImageRole::Head) => ImageHandle::new(&t.std_head),
            (Space::Std, ImageRole::Brain) => ImageHandle::new(&t.std_brain),
            (Space::Std, ImageRole::MaskDil) => ImageHandle::new(&t.std_mask_dil),
            (Space::Std4, ImageRole::Head) => ImageHandle::new(&t.std4_head),
            (Space::Std4, ImageRole::Brain) => ImageHandle::new(&t.std4_brain),
            (Space::Std4, ImageRole::MaskDil) => ImageHandle::new(&t.std4_mask_dil),
        }
    }

    /// Folder holding the ROIs that live in `space`: `roi/<space>`.
    pub fn roi_dir(&self, space: Space) -> PathBuf {
        self.root.join("roi").join(space.label())
    }

    /// Folder holding the transforms that end in `space`: `roi/reg_<space>`.
    pub fn reg_dir(&self, space: Space) -> PathBuf {
        self.root.join("roi").join(format!("reg_{}", space.label()))
    }

    fn subject_image(&self, parts: &[&str]) -> ImageHandle {
        let path = parts.iter().fold(self.root.clone(), |acc, p| acc.join(p));
        ImageHandle::new(path)
    }
}


fn index(space: Space) -> usize {
    Space::ALL
        .iter()
        .position(|s| *s == space)
        .unwrap_or_default()
}
