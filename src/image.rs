//! Path handles for the two artifact kinds the FSL tools exchange: NIfTI images
//! (volumes, ROIs, warp fields) and plain text affine matrices.
//!
//! FSL tools accept image names with or without extension and pick one of
//! several on-disk variants, so an `ImageHandle` resolves the variant lazily.
//! The core never looks at voxel data; it only asks whether a complete file exists.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use approx::AbsDiffEq;
use byteordered::ByteOrdered;
use flate2::bufread::GzDecoder;
use ndarray::{arr1, Array2};

use crate::error::{Result, TransformError};
use crate::util::{
    is_gz_file, read_fixed_length_string, NIFTI1_HEADER_SIZE, NIFTI1_MAGIC_OFFSET,
    NIFTI2_HEADER_SIZE,
};

/// Image extensions in the order FSL prefers them.
pub const IMAGE_EXTENSIONS: [&str; 4] = [".nii.gz", ".nii", ".hdr", ".img"];

/// A (possibly extension-less) path to a NIfTI image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageHandle {
    path: PathBuf,
}

impl ImageHandle {
    pub fn new<P: Into<PathBuf>>(path: P) -> ImageHandle {
        ImageHandle { path: path.into() }
    }

    /// The path as given.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The path with any image extension removed, the form FSL tools take as an argument.
    pub fn stem_path(&self) -> PathBuf {
        let text = self.path.to_string_lossy();
        for ext in IMAGE_EXTENSIONS.iter() {
            if let Some(stripped) = text.strip_suffix(ext) {
                return PathBuf::from(stripped);
            }
        }
        self.path.clone()
    }

    /// The file name without directory and image extension.
    pub fn name(&self) -> String {
        self.stem_path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Another image with the given name, in the same folder as this one.
    pub fn sibling(&self, name: &str) -> ImageHandle {
        let stem = self.stem_path();
        match stem.parent() {
            Some(dir) => ImageHandle::new(dir.join(name)),
            None => ImageHandle::new(name),
        }
    }

    /// The existing file backing this image, if any. For an analyze pair this is the `.hdr` file.
    pub fn resolve(&self) -> Option<PathBuf> {
        let stem = self.stem_path();
        if stem != self.path && self.path.is_file() {
            if self.path.to_string_lossy().ends_with(".img") {
                return Some(append(&stem, ".hdr")).filter(|p| p.is_file());
            }
            return Some(self.path.clone());
        }
        IMAGE_EXTENSIONS[..3]
            .iter()
            .map(|ext| append(&stem, ext))
            .find(|candidate| candidate.is_file())
    }

    pub fn exists(&self) -> bool {
        self.resolve().is_some()
    }

    /// Whether the image exists and starts with a readable NIfTI header.
    /// A zero-byte or truncated file left behind by a failed tool does not count.
    pub fn is_complete(&self) -> bool {
        self.validate().is_ok()
    }

    /// Check the header of the resolved file.
    pub fn validate(&self) -> Result<()> {
        let file = self.resolve().ok_or_else(|| TransformError::InvalidImage {
            path: self.path.clone(),
            reason: String::from("no such image"),
        })?;
        let gz = is_gz_file(&file);
        let reader = BufReader::new(File::open(&file)?);
        let outcome = if gz {
            check_nifti_header(GzDecoder::new(reader))
        } else {
            check_nifti_header(reader)
        };
        outcome.map_err(|reason| TransformError::InvalidImage { path: file, reason })
    }

    /// Delete every on-disk variant of this image. Missing files are not an error.
    pub fn remove(&self) -> Result<()> {
        let stem = self.stem_path();
        for ext in IMAGE_EXTENSIONS.iter() {
            remove_if_present(&append(&stem, ext))?;
        }
        if stem != self.path {
            remove_if_present(&self.path)?;
        }
        Ok(())
    }

    /// Move the resolved file (and its `.img` companion) to `dest`, keeping the extension.
    pub fn rename_to(&self, dest: &ImageHandle) -> Result<ImageHandle> {
        let file = self.resolve().ok_or_else(|| TransformError::InvalidImage {
            path: self.path.clone(),
            reason: String::from("no such image"),
        })?;
        let text = file.to_string_lossy().into_owned();
        let ext = IMAGE_EXTENSIONS
            .iter()
            .find(|ext| text.ends_with(*ext))
            .copied()
            .unwrap_or("");
        let dest_stem = dest.stem_path();
        dest.remove()?;
        fs::rename(&file, append(&dest_stem, ext))?;
        if ext == ".hdr" {
            let img = append(&self.stem_path(), ".img");
            if img.is_file() {
                fs::rename(img, append(&dest_stem, ".img"))?;
            }
        }
        Ok(ImageHandle::new(append(&dest_stem, ext)))
    }
}

impl fmt::Display for ImageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}


fn append(stem: &Path, ext: &str) -> PathBuf {
    let mut os = stem.as_os_str().to_owned();
    os.push(ext);
    PathBuf::from(os)
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}


/// Read `sizeof_hdr` in either byte order and, for NIfTI-1, the magic string.
fn check_nifti_header<S: Read>(input: S) -> std::result::Result<(), String> {
    let mut input = ByteOrdered::le(input);
    let raw = input.read_i32().map_err(|e| format!("unreadable header: {}", e))?;

    let size = if raw == NIFTI1_HEADER_SIZE || raw == NIFTI2_HEADER_SIZE {
        raw
    } else {
        raw.swap_bytes()
    };

    match size {
        NIFTI2_HEADER_SIZE => Ok(()),
        NIFTI1_HEADER_SIZE => {
            let mut input = input.into_inner();
            let skip = (NIFTI1_MAGIC_OFFSET - 4) as u64;
            let skipped = io::copy(&mut input.by_ref().take(skip), &mut io::sink())
                .map_err(|e| format!("truncated header: {}", e))?;
            if skipped != skip {
                return Err(String::from("truncated header"));
            }
            let magic = read_fixed_length_string(&mut input, 4)
                .map_err(|e| format!("truncated header: {}", e))?;
            match magic.as_str() {
                "n+1" | "ni1" => Ok(()),
                other => Err(format!("bad magic '{}'", other)),
            }
        }
        other => Err(format!("bad header size {}", other)),
    }
}


/// A 4x4 affine matrix as written by `flirt -omat` and `convert_xfm`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatrixHandle {
    path: PathBuf,
}

impl MatrixHandle {
    pub fn new<P: Into<PathBuf>>(path: P) -> MatrixHandle {
        MatrixHandle { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Whether the file parses as a valid affine.
    pub fn is_complete(&self) -> bool {
        self.read().is_ok()
    }

    /// Parse the matrix. It must hold 16 numbers and end in the row `0 0 0 1`.
    pub fn read(&self) -> Result<Array2<f64>> {
        let text = fs::read_to_string(&self.path)?;
        parse_affine(&text).map_err(|reason| TransformError::InvalidMatrix {
            path: self.path.clone(),
            reason,
        })
    }

    pub fn remove(&self) -> Result<()> {
        remove_if_present(&self.path)
    }
}

impl fmt::Display for MatrixHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}


/// Parse the whitespace separated text form of an FSL affine.
pub fn parse_affine(text: &str) -> std::result::Result<Array2<f64>, String> {
    let values = text
        .split_whitespace()
        .map(|tok| tok.parse::<f64>().map_err(|_| format!("not a number: '{}'", tok)))
        .collect::<std::result::Result<Vec<f64>, String>>()?;
    if values.len() != 16 {
        return Err(format!("expected 16 values, found {}", values.len()));
    }
    let mat = Array2::from_shape_vec((4, 4), values).map_err(|e| e.to_string())?;
    let last_row = mat.row(3).to_owned();
    if !last_row.abs_diff_eq(&arr1(&[0.0, 0.0, 0.0, 1.0]), 1e-6) {
        return Err(format!("last row is {:?}, not [0, 0, 0, 1]", last_row.to_vec()));
    }
    Ok(mat)
}

/// The text form of an affine, one row per line.
pub fn format_affine(mat: &Array2<f64>) -> String {
    mat.outer_iter()
        .map(|row| {
            row.iter()
                .map(|v| format!("{:.6}", v))
                .collect::<Vec<String>>()
                .join("  ")
        })
        .collect::<Vec<String>>()
        .join("\n")
        + "\n"
}
