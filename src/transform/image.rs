use std::fs::{self, File as FsFile};
use std::io::BufReader;

use camino::{Utf8Path, Utf8PathBuf};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ExtendedColorType, ImageEncoder, ImageFormat};
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::error::TransformError;
use crate::file::File;

use super::{FileTransform, StepContext};

pub(super) const NAME: &str = "optimize-images";

const DIR_CACHE: &str = "images";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageOptions {
    /// Accepted for compatibility, the JPEG encoder only writes baseline.
    pub progressive: bool,
    /// Accepted for compatibility, GIFs pass through unchanged.
    pub interlaced: bool,
    /// Re-encode JPEGs at this quality. Left alone when unset.
    pub jpeg_quality: Option<u8>,
    /// Keep optimized output in the project cache directory.
    pub cache: bool,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            progressive: true,
            interlaced: true,
            jpeg_quality: None,
            cache: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ImageMetadata {
    width: u32,
    height: u32,
    original: u64,
    optimized: u64,
}

/// Lossless PNG recompression and optional JPEG re-encoding.
///
/// The smaller of the original and the re-encoded bytes is kept, so the
/// output is never larger than the input. Results are cached by content.
pub struct OptimizeImages {
    options: ImageOptions,
}

impl OptimizeImages {
    pub fn new(options: ImageOptions) -> Self {
        Self { options }
    }

    fn cache_key(&self, file: &File) -> Hash32 {
        let config = format!("q{:?}", self.options.jpeg_quality);
        Hash32::hash_parts([
            file.relative.as_str().as_bytes(),
            config.as_bytes(),
            file.contents.as_slice(),
        ])
    }

    fn optimize(&self, format: ImageFormat, bytes: &[u8]) -> Result<(Vec<u8>, u32, u32), image::ImageError> {
        let img = image::load_from_memory_with_format(bytes, format)?;
        let (width, height) = (img.width(), img.height());
        let mut out = Vec::new();

        match format {
            ImageFormat::Png => {
                PngEncoder::new_with_quality(&mut out, CompressionType::Best, FilterType::Adaptive)
                    .write_image(img.as_bytes(), width, height, img.color().into())?;
            }
            ImageFormat::Jpeg => match self.options.jpeg_quality {
                Some(quality) => {
                    let rgb = img.to_rgb8();
                    JpegEncoder::new_with_quality(&mut out, quality).write_image(
                        rgb.as_raw(),
                        width,
                        height,
                        ExtendedColorType::Rgb8,
                    )?;
                }
                None => return Ok((bytes.to_vec(), width, height)),
            },
            _ => return Ok((bytes.to_vec(), width, height)),
        }

        if out.len() < bytes.len() {
            Ok((out, width, height))
        } else {
            Ok((bytes.to_vec(), width, height))
        }
    }
}

fn cached(dir: &Utf8Path, key: &str) -> Option<(Vec<u8>, ImageMetadata)> {
    let meta = FsFile::open(dir.join(format!("{key}.meta.cbor"))).ok()?;
    let meta = ciborium::from_reader::<ImageMetadata, _>(BufReader::new(meta)).ok()?;
    let bytes = fs::read(dir.join(format!("{key}.bin"))).ok()?;
    (bytes.len() as u64 == meta.optimized).then_some((bytes, meta))
}

fn store(dir: &Utf8Path, key: &str, bytes: &[u8], meta: &ImageMetadata) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join(format!("{key}.bin")), bytes)?;
    let file = FsFile::create(dir.join(format!("{key}.meta.cbor")))?;
    ciborium::into_writer(meta, file).map_err(std::io::Error::other)
}

impl FileTransform for OptimizeImages {
    fn name(&self) -> &str {
        NAME
    }

    fn transform(&self, ctx: &StepContext<'_>, mut file: File) -> Result<Option<File>, TransformError> {
        let Some(format) = file.extension().and_then(ImageFormat::from_extension) else {
            return Ok(Some(file));
        };
        if !matches!(format, ImageFormat::Png | ImageFormat::Jpeg) {
            return Ok(Some(file));
        }

        let dir: Utf8PathBuf = ctx.env.resolve(&ctx.env.cache).join(DIR_CACHE);
        let key = self.cache_key(&file).to_hex();

        if self.options.cache
            && let Some((bytes, meta)) = cached(&dir, &key)
        {
            tracing::trace!(file = %file.relative, width = meta.width, height = meta.height, "image cache hit");
            file.contents = bytes;
            return Ok(Some(file));
        }

        let (bytes, width, height) = self
            .optimize(format, &file.contents)
            .map_err(|e| TransformError::new(NAME, file.path(), e.to_string()))?;

        let meta = ImageMetadata {
            width,
            height,
            original: file.contents.len() as u64,
            optimized: bytes.len() as u64,
        };

        tracing::debug!(
            file = %file.relative,
            width,
            height,
            saved = meta.original - meta.optimized,
            "optimized image"
        );

        if self.options.cache
            && let Err(e) = store(&dir, &key, &bytes, &meta)
        {
            tracing::warn!("couldn't cache {}: {e}", file.relative);
        }

        file.contents = bytes;
        Ok(Some(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Environment, Mode};

    fn dimensions(bytes: &[u8]) -> (u32, u32) {
        let img = image::load_from_memory(bytes).unwrap();
        (img.width(), img.height())
    }

    fn noisy_png() -> Vec<u8> {
        // a gradient written with the fastest settings leaves room to shrink
        let img = image::RgbImage::from_fn(64, 64, |x, y| image::Rgb([x as u8 * 4, y as u8 * 4, 128]));
        let mut out = Vec::new();
        PngEncoder::new_with_quality(&mut out, CompressionType::Fast, FilterType::NoFilter)
            .write_image(img.as_raw(), 64, 64, ExtendedColorType::Rgb8)
            .unwrap();
        out
    }

    fn project() -> (tempfile::TempDir, Environment) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, Environment::new(root, Mode::Build))
    }

    #[test]
    fn png_never_grows_and_stays_decodable() {
        let (_dir, env) = project();
        let png = noisy_png();
        let file = File::new(env.root.join("app/images"), "g.png", png.clone());

        let out = OptimizeImages::new(ImageOptions::default())
            .transform(&StepContext { env: &env }, file)
            .unwrap()
            .unwrap();

        assert!(out.contents.len() <= png.len());
        assert_eq!(dimensions(&out.contents), (64, 64));
    }

    #[test]
    fn second_run_hits_the_cache() {
        let (_dir, env) = project();
        let t = OptimizeImages::new(ImageOptions::default());
        let file = || File::new(env.root.join("app/images"), "g.png", noisy_png());

        let first = t.transform(&StepContext { env: &env }, file()).unwrap().unwrap();
        let cache = env.root.join(".cache/images");
        assert_eq!(fs::read_dir(&cache).unwrap().count(), 2);

        let second = t.transform(&StepContext { env: &env }, file()).unwrap().unwrap();
        assert_eq!(first.contents, second.contents);
    }

    #[test]
    fn other_files_pass_through() {
        let (_dir, env) = project();
        let svg = File::new(env.root.join("app/images"), "logo.svg", "<svg/>");
        let out = OptimizeImages::new(ImageOptions::default())
            .transform(&StepContext { env: &env }, svg)
            .unwrap()
            .unwrap();
        assert_eq!(out.contents, b"<svg/>");
    }

    #[test]
    fn corrupt_png_is_a_transform_error() {
        let (_dir, env) = project();
        let file = File::new(env.root.join("app/images"), "bad.png", vec![0x89, b'P', b'N', b'G']);
        let err = OptimizeImages::new(ImageOptions::default())
            .transform(&StepContext { env: &env }, file)
            .unwrap_err();
        assert_eq!(err.transform, "optimize-images");
        assert!(err.path.ends_with("bad.png"));
    }
}
