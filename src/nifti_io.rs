//! NIfTI-1 reading and writing
//!
//! Reads `.nii` and `.nii.gz` files (gzip is auto-detected) into flat
//! Fortran-ordered buffers and writes float32 NIfTI-1 volumes and series.

use std::io::{Cursor, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array;
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};

use crate::error::{FcError, Result};

/// A 3D volume loaded from NIfTI
pub struct NiftiData {
    /// Voxel values, x fastest
    pub data: Vec<f64>,
    /// Dimensions (nx, ny, nz)
    pub dims: (usize, usize, usize),
    /// Voxel sizes in mm
    pub voxel_size: (f64, f64, f64),
    /// Affine transformation matrix (4x4, row-major)
    pub affine: [f64; 16],
    pub scl_slope: f64,
    pub scl_inter: f64,
}

/// A 4D series loaded from NIfTI (BOLD runs, stacked group maps)
pub struct NiftiSeries {
    /// Values, x fastest then y, z, t
    pub data: Vec<f64>,
    /// Dimensions (nx, ny, nz, nt)
    pub dims: (usize, usize, usize, usize),
    pub voxel_size: (f64, f64, f64),
    pub affine: [f64; 16],
    /// Repetition time in seconds (pixdim[4])
    pub tr: f64,
}

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Header summary used to make read errors actionable
fn get_header_info(bytes: &[u8]) -> String {
    if bytes.len() < 348 {
        return format!("File too small ({} bytes, need at least 348)", bytes.len());
    }

    let sizeof_hdr = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let magic = String::from_utf8_lossy(&bytes[344..348]).to_string();
    let datatype = i16::from_le_bytes([bytes[70], bytes[71]]);

    format!("sizeof_hdr={}, magic='{}', datatype={}", sizeof_hdr, magic, datatype)
}

fn read_object(bytes: &[u8]) -> Result<InMemNiftiObject> {
    if is_gzip(bytes) {
        InMemNiftiObject::from_reader(GzDecoder::new(Cursor::new(bytes))).map_err(|e| {
            let mut decompressed = Vec::new();
            let info = if GzDecoder::new(Cursor::new(bytes))
                .read_to_end(&mut decompressed)
                .is_ok()
            {
                get_header_info(&decompressed)
            } else {
                "could not decompress".to_string()
            };
            FcError::Nifti(format!("failed to read gzipped NIfTI: {} ({})", e, info))
        })
    } else {
        let info = get_header_info(bytes);
        InMemNiftiObject::from_reader(Cursor::new(bytes))
            .map_err(|e| FcError::Nifti(format!("failed to read NIfTI: {} ({})", e, info)))
    }
}

/// Load a 3D volume from bytes. A 4D file yields its first volume.
pub fn load_nifti(bytes: &[u8]) -> Result<NiftiData> {
    let obj = read_object(bytes)?;
    let header = obj.header();

    if (header.dim[0] as usize) < 3 {
        return Err(FcError::Nifti(format!(
            "expected at least a 3D volume, got {}D",
            header.dim[0]
        )));
    }

    let voxel_size = (
        header.pixdim[1] as f64,
        header.pixdim[2] as f64,
        header.pixdim[3] as f64,
    );
    let scl_slope = if header.scl_slope == 0.0 { 1.0 } else { header.scl_slope as f64 };
    let scl_inter = header.scl_inter as f64;
    let affine = get_affine(header);

    let array: Array<f64, _> = obj
        .into_volume()
        .into_ndarray()
        .map_err(|e| FcError::Nifti(format!("failed to convert to ndarray: {}", e)))?;
    let shape = array.shape().to_vec();
    if shape.len() < 3 {
        return Err(FcError::Nifti(format!("expected at least a 3D array, got {}D", shape.len())));
    }

    // nifti-rs may squeeze or reorder; trust the array shape
    let (nx, ny, nz) = (shape[0], shape[1], shape[2]);
    let mut data = Vec::with_capacity(nx * ny * nz);
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let v = if shape.len() == 3 {
                    array[[i, j, k]]
                } else {
                    array[[i, j, k, 0]]
                };
                data.push(v);
            }
        }
    }

    Ok(NiftiData {
        data,
        dims: (nx, ny, nz),
        voxel_size,
        affine,
        scl_slope,
        scl_inter,
    })
}

/// Load a 4D series from bytes. A 3D file yields a single-volume series.
pub fn load_nifti_series(bytes: &[u8]) -> Result<NiftiSeries> {
    let obj = read_object(bytes)?;
    let header = obj.header();

    let voxel_size = (
        header.pixdim[1] as f64,
        header.pixdim[2] as f64,
        header.pixdim[3] as f64,
    );
    let tr = header.pixdim[4] as f64;
    let affine = get_affine(header);

    let array: Array<f64, _> = obj
        .into_volume()
        .into_ndarray()
        .map_err(|e| FcError::Nifti(format!("failed to convert to ndarray: {}", e)))?;
    let shape = array.shape().to_vec();
    if shape.len() < 3 {
        return Err(FcError::Nifti(format!("expected at least a 3D array, got {}D", shape.len())));
    }

    let (nx, ny, nz) = (shape[0], shape[1], shape[2]);
    let nt = if shape.len() >= 4 { shape[3] } else { 1 };

    let mut data = Vec::with_capacity(nx * ny * nz * nt);
    for t in 0..nt {
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let v = if shape.len() == 3 {
                        array[[i, j, k]]
                    } else {
                        array[[i, j, k, t]]
                    };
                    data.push(v);
                }
            }
        }
    }

    Ok(NiftiSeries {
        data,
        dims: (nx, ny, nz, nt),
        voxel_size,
        affine,
        tr,
    })
}

/// Affine from the sform when present, voxel scaling otherwise
fn get_affine(header: &NiftiHeader) -> [f64; 16] {
    if header.sform_code > 0 {
        let s = &header.srow_x;
        let t = &header.srow_y;
        let u = &header.srow_z;
        [
            s[0] as f64, s[1] as f64, s[2] as f64, s[3] as f64,
            t[0] as f64, t[1] as f64, t[2] as f64, t[3] as f64,
            u[0] as f64, u[1] as f64, u[2] as f64, u[3] as f64,
            0.0, 0.0, 0.0, 1.0,
        ]
    } else {
        let vsx = header.pixdim[1] as f64;
        let vsy = header.pixdim[2] as f64;
        let vsz = header.pixdim[3] as f64;
        [
            vsx, 0.0, 0.0, 0.0,
            0.0, vsy, 0.0, 0.0,
            0.0, 0.0, vsz, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ]
    }
}

/// Encode float32 NIfTI-1 bytes for a 3D (`dims.len() == 3`) or 4D volume
pub fn encode_nifti(
    data: &[f64],
    dims: &[usize],
    voxel_size: (f64, f64, f64),
    affine: &[f64; 16],
    tr: f64,
) -> Result<Vec<u8>> {
    if dims.len() < 3 || dims.len() > 4 {
        return Err(FcError::Nifti(format!("cannot encode a {}D image", dims.len())));
    }
    let expected: usize = dims.iter().product();
    if expected != data.len() {
        return Err(FcError::Shape(format!(
            "data has {} values but dims {:?} need {}",
            data.len(),
            dims,
            expected
        )));
    }
    if dims.iter().any(|&d| d > i16::MAX as usize) {
        return Err(FcError::Nifti(format!("dimension too large for NIfTI-1: {:?}", dims)));
    }

    let (vsx, vsy, vsz) = voxel_size;
    let mut header = [0u8; 348];

    header[0..4].copy_from_slice(&348i32.to_le_bytes());

    let mut dim: [i16; 8] = [dims.len() as i16, 1, 1, 1, 1, 1, 1, 1];
    for (i, &d) in dims.iter().enumerate() {
        dim[i + 1] = d as i16;
    }
    for (i, &d) in dim.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    // FLOAT32
    header[70..72].copy_from_slice(&16i16.to_le_bytes());
    header[72..74].copy_from_slice(&32i16.to_le_bytes());

    let pixdim: [f32; 8] = [1.0, vsx as f32, vsy as f32, vsz as f32, tr as f32, 1.0, 1.0, 1.0];
    for (i, &p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    // vox_offset, scl_slope, scl_inter
    header[108..112].copy_from_slice(&352.0f32.to_le_bytes());
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

    // xyzt_units: mm + s
    header[123] = 2 | 8;

    // sform_code = 1 (scanner anat)
    header[254..256].copy_from_slice(&1i16.to_le_bytes());
    for row in 0..3 {
        for col in 0..4 {
            let offset = 280 + row * 16 + col * 4;
            header[offset..offset + 4]
                .copy_from_slice(&(affine[row * 4 + col] as f32).to_le_bytes());
        }
    }

    header[344..348].copy_from_slice(b"n+1\0");

    let mut buffer = Vec::with_capacity(352 + data.len() * 4);
    buffer.write_all(&header)?;
    // empty extension block
    buffer.write_all(&[0u8; 4])?;
    for &val in data {
        buffer.write_all(&(val as f32).to_le_bytes())?;
    }

    Ok(buffer)
}

fn gzip_bytes(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

/// Read a 3D NIfTI file
pub fn read_nifti_file(path: &Path) -> Result<NiftiData> {
    if !path.exists() {
        return Err(FcError::MissingInput(path.to_path_buf()));
    }
    let bytes = std::fs::read(path)?;
    load_nifti(&bytes).map_err(|e| match e {
        FcError::Nifti(msg) => FcError::Nifti(format!("{}: {}", path.display(), msg)),
        other => other,
    })
}

/// Read a 4D NIfTI file
pub fn read_series_file(path: &Path) -> Result<NiftiSeries> {
    if !path.exists() {
        return Err(FcError::MissingInput(path.to_path_buf()));
    }
    let bytes = std::fs::read(path)?;
    load_nifti_series(&bytes).map_err(|e| match e {
        FcError::Nifti(msg) => FcError::Nifti(format!("{}: {}", path.display(), msg)),
        other => other,
    })
}

/// Write a NIfTI file, gzip compressed when the path ends with `.gz`
pub fn save_nifti_to_file(
    path: &Path,
    data: &[f64],
    dims: &[usize],
    voxel_size: (f64, f64, f64),
    affine: &[f64; 16],
    tr: f64,
) -> Result<()> {
    let raw = encode_nifti(data, dims, voxel_size, affine, tr)?;
    let bytes = if path.to_string_lossy().ends_with(".gz") {
        gzip_bytes(&raw)?
    } else {
        raw
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Decompress a `.nii.gz` into a plain `.nii` (SPM cannot read gzip)
pub fn gunzip_file(src: &Path, dst: &Path) -> Result<()> {
    let input = std::fs::File::open(src).map_err(|_| FcError::MissingInput(src.to_path_buf()))?;
    let mut decoder = GzDecoder::new(input);
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut output = std::fs::File::create(dst)?;
    std::io::copy(&mut decoder, &mut output)?;
    Ok(())
}
