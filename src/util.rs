//! Utility functions used in all other neurotransforms modules.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use byteordered::byteorder::ReadBytesExt;
use byteordered::ByteOrdered;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::Result;

/// Size in bytes of a NIfTI-1 header.
pub const NIFTI1_HEADER_SIZE: i32 = 348;

/// Size in bytes of a NIfTI-2 header.
pub const NIFTI2_HEADER_SIZE: i32 = 540;

/// Byte offset of the magic string in a NIfTI-1 header.
pub const NIFTI1_MAGIC_OFFSET: usize = 344;

/// Check whether the file extension ends with ".gz".
pub fn is_gz_file<P>(path: P) -> bool
where
    P: AsRef<Path>,
{
    path.as_ref()
        .file_name()
        .map(|a| a.to_string_lossy().ends_with(".gz"))
        .unwrap_or(false)
}


/// Read a fixed length zero-terminated byte string of the given length from the input. Embedded '\0' chars are allowed, but not added to the returned String.
pub fn read_fixed_length_string<S>(input: &mut S, len: usize) -> Result<String>
where
    S: Read,
{
    let mut info_line = String::with_capacity(len);
    for _  in 0..len   {
        let cur_char = input.read_u8()? as char;
        if cur_char != '\0'  {
            info_line.push(cur_char);
        }
    }
    Ok(info_line)
}


/// Write a header-only single-file NIfTI-1 volume (1x1x1, uint8) to the given path.
/// If the file's name ends with ".gz", the output is GZip compressed.
///
/// The result is a syntactically valid image that FSL tools can open. It is used
/// by dry runs and tests as a stand-in for a real acquisition.
pub fn write_empty_nifti<P: AsRef<Path>>(path: P) -> Result<()> {
    let gz = is_gz_file(&path);
    let file = BufWriter::new(File::create(&path)?);
    if gz {
        let mut encoder = GzEncoder::new(file, Compression::default());
        write_empty_nifti_to(&mut encoder)?;
        encoder.finish()?.flush()?;
    } else {
        let mut file = file;
        write_empty_nifti_to(&mut file)?;
        file.flush()?;
    }
    Ok(())
}


fn write_empty_nifti_to<W: Write>(output: W) -> Result<()> {
    let mut output = ByteOrdered::le(output);
    let mut hdr = [0u8; NIFTI1_HEADER_SIZE as usize];

    hdr[0..4].copy_from_slice(&NIFTI1_HEADER_SIZE.to_le_bytes());
    // dim[0..4] = 3, 1, 1, 1
    for (idx, val) in [3i16, 1, 1, 1].iter().enumerate() {
        let at = 40 + idx * 2;
        hdr[at..at + 2].copy_from_slice(&val.to_le_bytes());
    }
    hdr[70..72].copy_from_slice(&2i16.to_le_bytes()); // datatype: DT_UNSIGNED_CHAR
    hdr[72..74].copy_from_slice(&8i16.to_le_bytes()); // bitpix
    for idx in 0..4 {
        let at = 76 + idx * 4;
        hdr[at..at + 4].copy_from_slice(&1.0f32.to_le_bytes()); // pixdim
    }
    hdr[108..112].copy_from_slice(&352.0f32.to_le_bytes()); // vox_offset
    hdr[NIFTI1_MAGIC_OFFSET..NIFTI1_MAGIC_OFFSET + 4].copy_from_slice(b"n+1\0");

    output.write_all(&hdr)?;
    output.write_all(&[0u8; 4])?; // empty extension flag
    output.write_u8(0)?; // the single voxel
    Ok(())
}
