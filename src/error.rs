use quick_error::quick_error;
use std::io::Error as IOError;
use std::path::PathBuf;

use crate::space::{Space, TransformRequest};

quick_error! {
    /// Error type for all error variants originated by this crate.
    #[derive(Debug)]
    pub enum TransformError {
        /// The subject has no acquisition for a space the request needs.
        MissingModality { subject: String, space: Space, request: TransformRequest } {
            display("Subject {}: cannot compute {}, no {} acquisition", subject, request, space)
        }

        /// A representative image, mask or template is absent although its modality exists.
        MissingPrerequisite { subject: String, request: TransformRequest, path: PathBuf } {
            display("Subject {}: cannot compute {}, missing {}", subject, request, path.display())
        }

        /// An external tool exited non-zero, timed out or did not write its declared output.
        ///
        /// The runner does not know the subject; `subject` and `request` are filled
        /// in by [`TransformError::for_request`] where the command was issued.
        ExternalToolFailure {
            subject: String,
            request: Option<TransformRequest>,
            command: String,
            status: String,
            stderr: String,
        } {
            display("{}External tool failed ({}): {}\n{}", context(subject, request), status, command, stderr)
        }

        /// A mandatory image (T1 or a standard template) is missing when building a subject.
        IncompleteSubject { subject: String, path: PathBuf } {
            display("Subject {}: mandatory image {} not found", subject, path.display())
        }

        /// A caller supplied ROI does not resolve to an existing image.
        InputNotFound { subject: String, request: TransformRequest, path: PathBuf } {
            display("Subject {}: input ROI {} for {} not found", subject, path.display(), request)
        }

        /// Two ROIs of one batch would be written to the same output image.
        DuplicateOutput { subject: String, request: TransformRequest, path: PathBuf } {
            display("Subject {}: output {} of {} is already written by another ROI of the batch",
                subject, path.display(), request)
        }

        /// No recipe exists for the requested pair.
        UnsupportedPair { request: TransformRequest } {
            display("Transform {} is not supported", request)
        }

        /// The recipe table recursed beyond its depth bound. This is a bug in the catalog.
        RecipeLoop { request: TransformRequest, depth: usize } {
            display("Recipe for {} did not terminate after {} levels", request, depth)
        }

        InvalidMatrix { path: PathBuf, reason: String } {
            display("Invalid affine matrix {}: {}", path.display(), reason)
        }

        InvalidImage { path: PathBuf, reason: String } {
            display("Invalid NIfTI image {}: {}", path.display(), reason)
        }

        UnknownSpace { name: String } {
            display("Unknown coordinate space '{}'", name)
        }

        /// Invalid TOML configuration.
        Config(err: toml::de::Error) {
            from()
            source(err)
        }

        /// I/O Error
        Io(err: IOError) {
            from()
            source(err)
        }
    }
}

// A failed prerequisite is reported against every ROI of a batch that needs it.
impl Clone for TransformError {
    fn clone(&self) -> Self {
        use TransformError::*;
        match self {
            MissingModality { subject, space, request } => MissingModality {
                subject: subject.clone(),
                space: *space,
                request: *request,
            },
            MissingPrerequisite { subject, request, path } => MissingPrerequisite {
                subject: subject.clone(),
                request: *request,
                path: path.clone(),
            },
            ExternalToolFailure { subject, request, command, status, stderr } => ExternalToolFailure {
                subject: subject.clone(),
                request: *request,
                command: command.clone(),
                status: status.clone(),
                stderr: stderr.clone(),
            },
            IncompleteSubject { subject, path } => IncompleteSubject {
                subject: subject.clone(),
                path: path.clone(),
            },
            InputNotFound { subject, request, path } => InputNotFound {
                subject: subject.clone(),
                request: *request,
                path: path.clone(),
            },
            DuplicateOutput { subject, request, path } => DuplicateOutput {
                subject: subject.clone(),
                request: *request,
                path: path.clone(),
            },
            UnsupportedPair { request } => UnsupportedPair { request: *request },
            RecipeLoop { request, depth } => RecipeLoop {
                request: *request,
                depth: *depth,
            },
            InvalidMatrix { path, reason } => InvalidMatrix {
                path: path.clone(),
                reason: reason.clone(),
            },
            InvalidImage { path, reason } => InvalidImage {
                path: path.clone(),
                reason: reason.clone(),
            },
            UnknownSpace { name } => UnknownSpace { name: name.clone() },
            Config(err) => Config(err.clone()),
            Io(err) => Io(IOError::new(err.kind(), err.to_string())),
        }
    }
}

impl TransformError {
    /// A tool failure not yet tied to a subject.
    pub fn tool_failure(command: String, status: String, stderr: String) -> TransformError {
        TransformError::ExternalToolFailure {
            subject: String::new(),
            request: None,
            command,
            status,
            stderr,
        }
    }

    /// Attach the subject and the transform a tool failure belongs to.
    ///
    /// Context already present is kept, so the innermost artifact of a recipe
    /// chain is the one reported. Other variants are returned unchanged.
    pub fn for_request(self, subject: &str, request: TransformRequest) -> TransformError {
        match self {
            TransformError::ExternalToolFailure { subject: s, request: r, command, status, stderr } => {
                TransformError::ExternalToolFailure {
                    subject: if s.is_empty() { subject.to_string() } else { s },
                    request: r.or(Some(request)),
                    command,
                    status,
                    stderr,
                }
            }
            other => other,
        }
    }
}

fn context(subject: &str, request: &Option<TransformRequest>) -> String {
    match (subject.is_empty(), request) {
        (true, None) => String::new(),
        (true, Some(request)) => format!("{}: ", request),
        (false, None) => format!("Subject {}: ", subject),
        (false, Some(request)) => format!("Subject {}, {}: ", subject, request),
    }
}

/// Alias type for results originated from this crate.
pub type Result<T> = ::std::result::Result<T, TransformError>;
