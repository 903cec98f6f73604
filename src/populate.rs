//! Bulk entry points that compute every transform a modality needs.
//!
//! All of them are idempotent: artifacts already on disk are skipped by
//! `ensure`. They stop at the first error, since the remaining transforms of
//! the subject most likely depend on the one that failed.

use crate::catalog::Artifact;
use crate::computer::TransformComputer;
use crate::error::Result;
use crate::space::{Space, TransformRequest};

/// The two EPI modalities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpiKind {
    Rs,
    Fmri,
}

impl EpiKind {
    pub fn space(&self) -> Space {
        match self {
            EpiKind::Rs => Space::Rs,
            EpiKind::Fmri => Space::Fmri,
        }
    }
}

/// Both linearities of `source -> dest`.
fn both(source: Space, dest: Space) -> Vec<TransformRequest> {
    vec![
        TransformRequest::new(source, dest, true),
        TransformRequest::new(source, dest, false),
    ]
}

fn linear(source: Space, dest: Space) -> Vec<TransformRequest> {
    vec![TransformRequest::new(source, dest, true)]
}

impl TransformComputer<'_> {
    /// HR <-> STD and HR <-> STD4, linear and non-linear, plus the STD <-> STD4 resampling.
    pub fn compute_all_for_hr_space(&self) -> Result<Vec<Artifact>> {
        use Space::*;
        let requests = [
            both(Hr, Std),
            both(Std, Hr),
            linear(Std, Std4),
            linear(Std4, Std),
            both(Hr, Std4),
            both(Std4, Hr),
        ];
        self.ensure_all("hr", requests.concat())
    }

    /// EPI <-> HR (linear only), EPI <-> STD and EPI <-> STD4.
    pub fn compute_all_for_epi_space(&self, kind: EpiKind) -> Result<Vec<Artifact>> {
        use Space::*;
        let e = kind.space();
        let requests = [
            linear(e, Hr),
            linear(Hr, e),
            both(e, Std),
            both(Std, e),
            both(e, Std4),
            both(Std4, e),
        ];
        self.ensure_all(e.label(), requests.concat())
    }

    /// DTI <-> HR, DTI <-> STD, DTI <-> STD4 and, with a T2, DTI <-> T2.
    pub fn compute_all_for_dti_space(&self) -> Result<Vec<Artifact>> {
        use Space::*;
        let mut requests = Vec::new();
        if self.context().has_space(T2) {
            requests.extend(both(Dti, T2));
            requests.extend(both(T2, Dti));
        }
        for (s, d) in [(Dti, Hr), (Hr, Dti), (Dti, Std), (Std, Dti), (Dti, Std4), (Std4, Dti)].iter() {
            requests.extend(both(*s, *d));
        }
        self.ensure_all("dti", requests)
    }

    /// T2 <-> HR, T2 <-> STD, T2 <-> STD4 and RS <-> FMRI, for the spaces the subject has.
    pub fn compute_all_extra(&self) -> Result<Vec<Artifact>> {
        use Space::*;
        let ctx = self.context();
        let candidates = [
            linear(T2, Hr),
            linear(Hr, T2),
            both(T2, Std),
            both(Std, T2),
            both(T2, Std4),
            both(Std4, T2),
            linear(Rs, Fmri),
            linear(Fmri, Rs),
        ]
        .concat();

        let (present, skipped): (Vec<TransformRequest>, Vec<TransformRequest>) = candidates
            .into_iter()
            .partition(|r| ctx.has_space(r.source()) && ctx.has_space(r.dest()));
        for request in skipped.iter() {
            tracing::info!(subject = ctx.label(), %request, "skipped, modality not acquired");
        }
        self.ensure_all("extra", present)
    }

    fn ensure_all(&self, group: &str, requests: Vec<TransformRequest>) -> Result<Vec<Artifact>> {
        let mut artifacts: Vec<Artifact> = Vec::with_capacity(requests.len());
        for request in requests {
            let artifact = self.ensure_request(request)?;
            if !artifacts.contains(&artifact) {
                artifacts.push(artifact);
            }
        }
        tracing::info!(subject = self.context().label(), group, count = artifacts.len(), "transforms ready");
        Ok(artifacts)
    }
}
