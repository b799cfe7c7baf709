use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use glam::{DMat3, DQuat, DVec2, DVec3};

use super::IoError;
use crate::camera::PinholeCamera;
use crate::types::{CameraIndex, GlobalPose, Observation, Reconstruction, Track};

/// COLMAP camera models understood by the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraModelId {
    /// f, cx, cy
    SimplePinhole,
    /// fx, fy, cx, cy
    Pinhole,
    /// f, cx, cy, k
    SimpleRadial,
    /// f, cx, cy, k1, k2
    Radial,
    /// fx, fy, cx, cy, k1, k2, p1, p2
    OpenCv,
}

impl CameraModelId {
    /// Model name as written in cameras.txt.
    pub fn name(&self) -> &'static str {
        match self {
            CameraModelId::SimplePinhole => "SIMPLE_PINHOLE",
            CameraModelId::Pinhole => "PINHOLE",
            CameraModelId::SimpleRadial => "SIMPLE_RADIAL",
            CameraModelId::Radial => "RADIAL",
            CameraModelId::OpenCv => "OPENCV",
        }
    }

    fn num_params(&self) -> usize {
        match self {
            CameraModelId::SimplePinhole => 3,
            CameraModelId::Pinhole => 4,
            CameraModelId::SimpleRadial => 4,
            CameraModelId::Radial => 5,
            CameraModelId::OpenCv => 8,
        }
    }
}

/// A camera line of cameras.txt.
#[derive(Debug, Clone, PartialEq)]
pub struct ColmapCamera {
    /// Camera id
    pub camera_id: u32,
    /// Camera model id
    pub model_id: CameraModelId,
    /// Image width
    pub width: usize,
    /// Image height
    pub height: usize,
    /// Camera parameters
    pub params: Vec<f64>,
}

impl ColmapCamera {
    /// Convert to a pinhole camera with radial distortion.
    ///
    /// Tangential coefficients of `OPENCV` cameras are ignored.
    pub fn to_pinhole(&self) -> Result<PinholeCamera, IoError> {
        if self.params.len() != self.model_id.num_params() {
            return Err(IoError::InvalidNumCameraParams {
                model: self.model_id.name().to_string(),
                actual: self.params.len(),
            });
        }
        let p = &self.params;
        Ok(match self.model_id {
            CameraModelId::SimplePinhole => PinholeCamera::new(p[0], p[0], p[1], p[2]),
            CameraModelId::Pinhole => PinholeCamera::new(p[0], p[1], p[2], p[3]),
            CameraModelId::SimpleRadial => {
                PinholeCamera::with_distortion(p[0], p[0], p[1], p[2], p[3], 0.0)
            }
            CameraModelId::Radial => {
                PinholeCamera::with_distortion(p[0], p[0], p[1], p[2], p[3], p[4])
            }
            CameraModelId::OpenCv => {
                PinholeCamera::with_distortion(p[0], p[1], p[2], p[3], p[4], p[5])
            }
        })
    }

    fn from_pinhole(camera_id: u32, cam: &PinholeCamera) -> Self {
        let (model_id, params) = if cam.has_distortion() {
            (
                CameraModelId::OpenCv,
                vec![cam.fx, cam.fy, cam.cx, cam.cy, cam.k1, cam.k2, 0.0, 0.0],
            )
        } else {
            (CameraModelId::Pinhole, vec![cam.fx, cam.fy, cam.cx, cam.cy])
        };
        Self {
            camera_id,
            model_id,
            // the principal point is assumed to be the image centre
            width: (2.0 * cam.cx).round().max(1.0) as usize,
            height: (2.0 * cam.cy).round().max(1.0) as usize,
            params,
        }
    }
}

/// An image entry of images.txt.
#[derive(Debug, Clone, PartialEq)]
pub struct ColmapImage {
    /// Image name
    pub name: String,
    /// Image id
    pub image_id: u32,
    /// Camera id
    pub camera_id: u32,
    /// World to camera rotation
    pub rotation: [f64; 4], // qw, qx, qy, qz
    /// World to camera translation
    pub translation: [f64; 3], // x, y, z
    /// Points2d as (x, y, point3d id or -1)
    pub points2d: Vec<(f64, f64, i64)>,
}

/// A point line of points3D.txt.
#[derive(Debug, Clone, PartialEq)]
pub struct ColmapPoint3d {
    /// Point3d id
    pub point3d_id: u64,
    /// x, y, z coordinates
    pub xyz: [f64; 3],
    /// rgb color
    pub rgb: [u8; 3],
    /// Error
    pub error: f64,
    /// Track as (image id, point2d index)
    pub track: Vec<(u32, u32)>,
}

// COLMAP ids are 1-based
fn colmap_id(camera: CameraIndex) -> u32 {
    camera as u32 + 1
}

/// Write cameras.txt, images.txt and points3D.txt of `rec` into `dir`.
///
/// Camera and image ids are the camera indices plus one. Only valid tracks are written.
pub fn write_text_model(dir: impl AsRef<Path>, rec: &Reconstruction) -> Result<(), IoError> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;

    let tracks: Vec<&Track> = rec.valid_tracks().collect();
    // per image: (x, y, point3d id), and the point2d index of every track observation
    let mut points2d: BTreeMap<CameraIndex, Vec<(f64, f64, i64)>> = BTreeMap::new();
    let mut track_refs: Vec<Vec<(u32, u32)>> = Vec::with_capacity(tracks.len());
    for (point_id, track) in tracks.iter().enumerate() {
        let mut refs = Vec::new();
        for obs in track.observations.iter().filter(|o| rec.poses.contains_key(&o.camera)) {
            let list = points2d.entry(obs.camera).or_default();
            refs.push((colmap_id(obs.camera), list.len() as u32));
            list.push((obs.pixel.x, obs.pixel.y, point_id as i64 + 1));
        }
        track_refs.push(refs);
    }

    let mut w = BufWriter::new(File::create(dir.join("cameras.txt"))?);
    writeln!(w, "# Camera list with one line of data per camera:")?;
    writeln!(w, "#   CAMERA_ID, MODEL, WIDTH, HEIGHT, PARAMS[]")?;
    writeln!(w, "# Number of cameras: {}", rec.calibrations.len())?;
    for (&camera, cam) in rec.calibrations.iter() {
        let c = ColmapCamera::from_pinhole(colmap_id(camera), cam);
        let params: Vec<String> = c.params.iter().map(|p| p.to_string()).collect();
        writeln!(
            w,
            "{} {} {} {} {}",
            c.camera_id,
            c.model_id.name(),
            c.width,
            c.height,
            params.join(" ")
        )?;
    }
    w.flush()?;

    let mut w = BufWriter::new(File::create(dir.join("images.txt"))?);
    writeln!(w, "# Image list with two lines of data per image:")?;
    writeln!(w, "#   IMAGE_ID, QW, QX, QY, QZ, TX, TY, TZ, CAMERA_ID, NAME")?;
    writeln!(w, "#   POINTS2D[] as (X, Y, POINT3D_ID)")?;
    writeln!(w, "# Number of images: {}", rec.poses.len())?;
    for (&camera, pose) in rec.poses.iter() {
        let q = DQuat::from_mat3(&pose.c_r_w());
        let t = pose.c_t_w();
        writeln!(
            w,
            "{} {} {} {} {} {} {} {} {} image_{:06}",
            colmap_id(camera),
            q.w,
            q.x,
            q.y,
            q.z,
            t.x,
            t.y,
            t.z,
            colmap_id(camera),
            camera
        )?;
        let line: Vec<String> = points2d
            .get(&camera)
            .map(|v| v.iter().map(|(x, y, id)| format!("{} {} {}", x, y, id)).collect())
            .unwrap_or_default();
        writeln!(w, "{}", line.join(" "))?;
    }
    w.flush()?;

    let mut w = BufWriter::new(File::create(dir.join("points3D.txt"))?);
    writeln!(w, "# 3D point list with one line of data per point:")?;
    writeln!(w, "#   POINT3D_ID, X, Y, Z, R, G, B, ERROR, TRACK[] as (IMAGE_ID, POINT2D_IDX)")?;
    writeln!(w, "# Number of points: {}", tracks.len())?;
    for (point_id, (track, refs)) in tracks.iter().zip(track_refs.iter()).enumerate() {
        let error = track.mean_reprojection_error(&rec.poses, &rec.calibrations);
        let refs: Vec<String> = refs.iter().map(|(i, k)| format!("{} {}", i, k)).collect();
        writeln!(
            w,
            "{} {} {} {} 128 128 128 {} {}",
            point_id + 1,
            track.point.x,
            track.point.y,
            track.point.z,
            if error.is_finite() { error } else { -1.0 },
            refs.join(" ")
        )?;
    }
    w.flush()?;

    log::info!(
        "wrote COLMAP model with {} images and {} points to {:?}",
        rec.poses.len(),
        tracks.len(),
        dir
    );
    Ok(())
}

// data lines of a COLMAP text file: comments dropped, blank lines kept only when
// `keep_blank` (an image without points has an empty second line)
fn data_lines(path: impl AsRef<Path>, keep_blank: bool) -> Result<Vec<String>, IoError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.starts_with('#') || (!keep_blank && line.trim().is_empty()) {
            continue;
        }
        lines.push(line);
    }
    Ok(lines)
}

/// Read the cameras.txt file.
pub fn read_cameras_txt(path: impl AsRef<Path>) -> Result<Vec<ColmapCamera>, IoError> {
    data_lines(path, false)?
        .iter()
        .map(|line| parse_camera_line(line))
        .collect()
}

/// Read the images.txt file.
pub fn read_images_txt(path: impl AsRef<Path>) -> Result<Vec<ColmapImage>, IoError> {
    let mut lines = data_lines(path, true)?;
    // a trailing newline after the last image leaves nothing to drop, extra blank lines do
    while lines.len() % 2 == 1 && lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    lines
        .chunks(2)
        .map(|chunk| match chunk {
            [line1, line2] => parse_image_line(line1, line2),
            _ => Err(IoError::ParseError("Invalid number of lines".to_string())),
        })
        .collect()
}

/// Read the points3D.txt file.
pub fn read_points3d_txt(path: impl AsRef<Path>) -> Result<Vec<ColmapPoint3d>, IoError> {
    data_lines(path, false)?
        .iter()
        .map(|line| parse_point3d_line(line))
        .collect()
}

/// Read a text model written by [`write_text_model`] back into a reconstruction.
///
/// Camera indices are the image ids minus one; keypoint indices are the point2d
/// indices within each image.
pub fn read_text_model(dir: impl AsRef<Path>) -> Result<Reconstruction, IoError> {
    let dir = dir.as_ref();
    let cameras = read_cameras_txt(dir.join("cameras.txt"))?;
    let images = read_images_txt(dir.join("images.txt"))?;
    let points = read_points3d_txt(dir.join("points3D.txt"))?;

    let calib_by_id: BTreeMap<u32, PinholeCamera> = cameras
        .iter()
        .map(|c| Ok((c.camera_id, c.to_pinhole()?)))
        .collect::<Result<_, IoError>>()?;

    let mut rec = Reconstruction::default();
    let mut image_by_id: BTreeMap<u32, &ColmapImage> = BTreeMap::new();
    for image in images.iter() {
        let camera = image
            .image_id
            .checked_sub(1)
            .ok_or_else(|| IoError::ParseError("image id 0".to_string()))? as CameraIndex;
        let calib = calib_by_id.get(&image.camera_id).ok_or_else(|| {
            IoError::ParseError(format!("unknown camera id {}", image.camera_id))
        })?;
        let [qw, qx, qy, qz] = image.rotation;
        let c_r_w = DMat3::from_quat(DQuat::from_xyzw(qx, qy, qz, qw).normalize());
        let [tx, ty, tz] = image.translation;
        rec.poses.insert(
            camera,
            GlobalPose::from_world_to_camera(c_r_w, DVec3::new(tx, ty, tz)),
        );
        rec.calibrations.insert(camera, *calib);
        image_by_id.insert(image.image_id, image);
    }

    for point in points.iter() {
        let mut observations = Vec::with_capacity(point.track.len());
        for &(image_id, idx) in point.track.iter() {
            let (x, y, _) = image_by_id
                .get(&image_id)
                .and_then(|im| im.points2d.get(idx as usize))
                .ok_or_else(|| {
                    IoError::ParseError(format!(
                        "point {} references missing observation ({}, {})",
                        point.point3d_id, image_id, idx
                    ))
                })?;
            observations.push(Observation {
                camera: image_id as CameraIndex - 1,
                keypoint: idx as usize,
                pixel: DVec2::new(*x, *y),
            });
        }
        observations.sort_by_key(|o| o.camera);
        rec.tracks.push(Track {
            observations,
            point: DVec3::from_array(point.xyz),
            valid: true,
        });
    }
    Ok(rec)
}

fn parse_part<T: std::str::FromStr>(s: &str) -> Result<T, IoError>
where
    T::Err: std::fmt::Display,
{
    s.parse::<T>()
        .map_err(|e| IoError::ParseError(format!("{}: {}", s, e)))
}

fn parse_array<T, const N: usize>(parts: &[&str], what: &str) -> Result<[T; N], IoError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    parts
        .iter()
        .map(|s| parse_part(s))
        .collect::<Result<Vec<T>, _>>()?
        .try_into()
        .map_err(|_| IoError::ParseError(format!("Invalid number of {}", what)))
}

fn parse_camera_model_id(model_id: &str) -> Result<CameraModelId, IoError> {
    match model_id {
        "SIMPLE_PINHOLE" => Ok(CameraModelId::SimplePinhole),
        "PINHOLE" => Ok(CameraModelId::Pinhole),
        "SIMPLE_RADIAL" => Ok(CameraModelId::SimpleRadial),
        "RADIAL" => Ok(CameraModelId::Radial),
        "OPENCV" => Ok(CameraModelId::OpenCv),
        _ => Err(IoError::ParseError(format!(
            "Unsupported camera model: {}",
            model_id
        ))),
    }
}

/// CAMERA_ID, MODEL, WIDTH, HEIGHT, PARAMS[0], PARAMS[1], ...
fn parse_camera_line(line: &str) -> Result<ColmapCamera, IoError> {
    let parts = line.split_whitespace().collect::<Vec<_>>();
    if parts.len() < 5 {
        return Err(IoError::ParseError(format!(
            "Invalid number of parts: {}",
            parts.len()
        )));
    }

    Ok(ColmapCamera {
        camera_id: parse_part(parts[0])?,
        model_id: parse_camera_model_id(parts[1])?,
        width: parse_part(parts[2])?,
        height: parse_part(parts[3])?,
        params: parts[4..]
            .iter()
            .map(|s| parse_part(s))
            .collect::<Result<Vec<_>, _>>()?,
    })
}

/// POINT3D_ID, X, Y, Z, R, G, B, ERROR, TRACK[0], TRACK[1], ...
fn parse_point3d_line(line: &str) -> Result<ColmapPoint3d, IoError> {
    let parts = line.split_whitespace().collect::<Vec<_>>();
    if parts.len() < 8 {
        return Err(IoError::ParseError(format!(
            "Invalid number of parts: {}",
            parts.len()
        )));
    }

    Ok(ColmapPoint3d {
        point3d_id: parse_part(parts[0])?,
        xyz: parse_array(&parts[1..4], "xyz coordinates")?,
        rgb: parse_array(&parts[4..7], "rgb values")?,
        error: parse_part(parts[7])?,
        track: parts[8..]
            .chunks_exact(2)
            .map(|chunk| -> Result<(u32, u32), IoError> {
                Ok((parse_part(chunk[0])?, parse_part(chunk[1])?))
            })
            .collect::<Result<Vec<_>, _>>()?,
    })
}

/// IMAGE_ID, QW, QX, QY, QZ, TX, TY, TZ, CAMERA_ID, NAME
/// POINTS2D[] as (X, Y, POINT3D_ID)
fn parse_image_line(line1: &str, line2: &str) -> Result<ColmapImage, IoError> {
    let parts1 = line1.split_whitespace().collect::<Vec<_>>();
    let parts2 = line2.split_whitespace().collect::<Vec<_>>();
    if parts1.len() < 10 {
        return Err(IoError::ParseError(format!(
            "Invalid number of image parts: {}",
            parts1.len()
        )));
    }

    Ok(ColmapImage {
        image_id: parse_part(parts1[0])?,
        rotation: parse_array(&parts1[1..5], "rotation coordinates")?,
        translation: parse_array(&parts1[5..8], "translation coordinates")?,
        camera_id: parse_part(parts1[8])?,
        name: parts1[9].to_string(),
        points2d: parts2
            .chunks_exact(3)
            .map(|chunk| -> Result<(f64, f64, i64), IoError> {
                Ok((
                    parse_part(chunk[0])?,
                    parse_part(chunk[1])?,
                    parse_part(chunk[2])?,
                ))
            })
            .collect::<Result<Vec<_>, _>>()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::so3::from_axis_angle_deg;
    use approx::assert_relative_eq;

    fn reconstruction() -> Reconstruction {
        let mut rec = Reconstruction::default();
        for i in 0..3 {
            let pose = GlobalPose::new(
                from_axis_angle_deg(DVec3::new(0.1, 1.0, 0.2), -8.0 * i as f64),
                DVec3::new(i as f64, 0.1 * i as f64, 0.0),
            );
            rec.poses.insert(i, pose);
            rec.calibrations.insert(i, PinholeCamera::new(500.0, 500.0, 320.0, 240.0));
        }
        rec.calibrations
            .insert(2, PinholeCamera::with_distortion(480.0, 490.0, 320.0, 240.0, -0.05, 0.01));
        for k in 0..4 {
            let point = DVec3::new(0.3 * k as f64, -0.2, 6.0);
            let observations = (0..3)
                .filter(|&c| !(k == 0 && c == 1))
                .map(|c| Observation {
                    camera: c,
                    keypoint: 0,
                    pixel: rec.calibrations[&c]
                        .project(rec.poses[&c].to_camera(point))
                        .unwrap(),
                })
                .collect();
            rec.tracks.push(Track {
                observations,
                point,
                valid: true,
            });
        }
        // invalid tracks are not exported
        rec.tracks.push(Track {
            observations: vec![],
            point: DVec3::ZERO,
            valid: false,
        });
        rec
    }

    #[test]
    fn test_write_read_text_model() -> Result<(), Box<dyn std::error::Error>> {
        let rec = reconstruction();
        let dir = tempfile::tempdir()?;
        write_text_model(dir.path(), &rec)?;

        let cameras = read_cameras_txt(dir.path().join("cameras.txt"))?;
        assert_eq!(cameras.len(), 3);
        assert_eq!(cameras[2].model_id, CameraModelId::OpenCv);
        assert_eq!(cameras[0].model_id, CameraModelId::Pinhole);

        let loaded = read_text_model(dir.path())?;
        assert_eq!(loaded.cameras(), vec![0, 1, 2]);
        assert_eq!(loaded.tracks.len(), 4);
        for (c, pose) in rec.poses.iter() {
            let other = loaded.poses[c];
            assert!((other.w_t_c - pose.w_t_c).length() < 1e-9);
            assert!((other.w_r_c - pose.w_r_c).to_cols_array().iter().all(|v| v.abs() < 1e-9));
            assert_eq!(loaded.calibrations[c], rec.calibrations[c]);
        }
        assert_eq!(loaded.tracks[0].len(), 2);
        assert_eq!(loaded.tracks[1].observations[1].camera, 1);
        for (a, b) in loaded.tracks.iter().zip(rec.valid_tracks()) {
            assert_relative_eq!((a.point - b.point).length(), 0.0, epsilon = 1e-12);
            for (oa, ob) in a.observations.iter().zip(b.observations.iter()) {
                assert_eq!(oa.camera, ob.camera);
                assert_relative_eq!((oa.pixel - ob.pixel).length(), 0.0, epsilon = 1e-12);
            }
        }
        assert!(loaded.stats().mean_reprojection_error < 1e-6);
        Ok(())
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_camera_line("1 PINHOLE 640").is_err());
        assert!(parse_camera_line("1 FISHEYE_X 640 480 1 2 3").is_err());
        let cam = parse_camera_line("1 SIMPLE_RADIAL 640 480 500 320 240 0.1");
        assert_eq!(
            cam.ok().and_then(|c| c.to_pinhole().ok()),
            Some(PinholeCamera::with_distortion(500.0, 500.0, 320.0, 240.0, 0.1, 0.0))
        );
        let bad = ColmapCamera {
            camera_id: 1,
            model_id: CameraModelId::Pinhole,
            width: 1,
            height: 1,
            params: vec![1.0],
        };
        assert!(matches!(
            bad.to_pinhole(),
            Err(IoError::InvalidNumCameraParams { actual: 1, .. })
        ));
        assert!(parse_point3d_line("1 0 0 0 255 255 300 0.5").is_err());
        assert!(parse_image_line("1 1 0 0 0 0 0 0", "").is_err());
    }
}
