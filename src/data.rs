pub mod tfrecord;

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    prelude::*,
};
use image::{ImageReader, RgbImage};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{
    io::Cursor,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::debug;
use walkdir::WalkDir;

use crate::{
    error::{Error, Result},
    utils::{image_to_tensor, prepare_image},
};

// ////////////////////////////////////////////////////////////////////////////
// Discovery

/// How the two domains are stored under `<base_dir>/data`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// `photo_tfrec/*.tfrec` and `monet_tfrec/*.tfrec`
    Tfrecord,
    /// `photo_jpg/` and `monet_jpg/` image folders
    Images,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Domain {
    /// X: what the service receives.
    Photo,
    /// Y: what G produces.
    Monet,
}
impl Domain {
    pub fn name(self) -> &'static str {
        match self {
            Domain::Photo => "photo",
            Domain::Monet => "monet",
        }
    }

    fn dir(self, format: SourceFormat) -> String {
        match format {
            SourceFormat::Tfrecord => format!("{}_tfrec", self.name()),
            SourceFormat::Images => format!("{}_jpg", self.name()),
        }
    }
}
impl SourceFormat {
    fn accepts(self, path: &Path) -> bool {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        match self {
            SourceFormat::Tfrecord => matches!(extension.as_deref(), Some("tfrec" | "tfrecord")),
            SourceFormat::Images => matches!(extension.as_deref(), Some("jpg" | "jpeg" | "png")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DomainFiles {
    pub photos: Vec<PathBuf>,
    pub paintings: Vec<PathBuf>,
}

/// Lists both domains' files, sorted. An empty domain is fatal: training on
/// one side only would silently produce garbage statistics.
pub fn discover(data_dir: &Path, format: SourceFormat) -> Result<DomainFiles> {
    Ok(DomainFiles {
        photos: discover_domain(data_dir, Domain::Photo, format)?,
        paintings: discover_domain(data_dir, Domain::Monet, format)?,
    })
}

fn discover_domain(data_dir: &Path, domain: Domain, format: SourceFormat) -> Result<Vec<PathBuf>> {
    let dir = data_dir.join(domain.dir(format));

    let mut files = WalkDir::new(&dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file() && format.accepts(entry.path()))
        .map(|entry| entry.into_path())
        .collect::<Vec<_>>();
    files.sort();

    if files.is_empty() {
        return Err(Error::EmptyDomain {
            domain: domain.name(),
            dir,
        });
    }
    debug!("{} {} files in {}", files.len(), domain.name(), dir.display());

    Ok(files)
}

// ////////////////////////////////////////////////////////////////////////////
// Loading

/// Still-encoded image bytes; decoding happens in the batcher workers.
#[derive(Clone, Debug)]
pub struct EncodedImage(Arc<[u8]>);
impl EncodedImage {
    /// Parses only the header, so that an unreadable record fails at load
    /// time instead of in the middle of an epoch.
    fn validated(bytes: Vec<u8>, path: &Path, index: usize) -> Result<Self> {
        let unusable = |reason: String| Error::Decode {
            path: path.to_path_buf(),
            index,
            reason,
        };
        ImageReader::new(Cursor::new(&bytes))
            .with_guessed_format()?
            .into_dimensions()
            .map_err(|err| unusable(err.to_string()))?;

        Ok(Self(bytes.into()))
    }

    pub fn decode(&self, height: usize, width: usize) -> Result<RgbImage> {
        let image = image::load_from_memory(&self.0)?;
        Ok(prepare_image(&image, height, width))
    }
}

/// Every image of one domain, in file order.
pub fn load_domain(files: &[PathBuf], format: SourceFormat) -> Result<Vec<EncodedImage>> {
    let mut images = Vec::new();
    for path in files {
        match format {
            SourceFormat::Tfrecord => {
                for (index, record) in tfrecord::read_records(path)?.into_iter().enumerate() {
                    let image = tfrecord::bytes_feature(&record, "image")
                        .and_then(|image| image.ok_or("no image feature"))
                        .map_err(|reason| Error::Decode {
                            path: path.clone(),
                            index,
                            reason: reason.to_owned(),
                        })?;
                    images.push(EncodedImage::validated(image.to_vec(), path, index)?);
                }
            }
            SourceFormat::Images => {
                images.push(EncodedImage::validated(std::fs::read(path)?, path, 0)?);
            }
        }
    }

    Ok(images)
}

// ////////////////////////////////////////////////////////////////////////////
// Dataset

#[derive(Clone, Debug)]
pub struct UnpairedItem {
    pub photo: EncodedImage,
    pub painting: EncodedImage,
}

/// Zips two independently ordered domains. Pairs carry no meaning: they only
/// decide which photo and which painting share a step.
#[derive(Clone, Debug)]
pub struct UnpairedDataset {
    photos: Arc<Vec<EncodedImage>>,
    paintings: Arc<Vec<EncodedImage>>,
    photo_order: Vec<usize>,
    painting_order: Vec<usize>,
    len: usize,
}
impl UnpairedDataset {
    /// File order, truncated to the shorter domain and to whole batches.
    pub fn new(
        photos: Arc<Vec<EncodedImage>>,
        paintings: Arc<Vec<EncodedImage>>,
        batch_size: usize,
    ) -> Self {
        let photo_order = (0..photos.len()).collect();
        let painting_order = (0..paintings.len()).collect();
        Self::from_orders(photos, paintings, photo_order, painting_order, batch_size)
    }

    /// Both domains shuffled independently, so every seed gives new pairs and,
    /// for the larger domain, a new subset.
    pub fn shuffled(
        photos: Arc<Vec<EncodedImage>>,
        paintings: Arc<Vec<EncodedImage>>,
        batch_size: usize,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut photo_order = (0..photos.len()).collect::<Vec<_>>();
        let mut painting_order = (0..paintings.len()).collect::<Vec<_>>();
        photo_order.shuffle(&mut rng);
        painting_order.shuffle(&mut rng);
        Self::from_orders(photos, paintings, photo_order, painting_order, batch_size)
    }

    fn from_orders(
        photos: Arc<Vec<EncodedImage>>,
        paintings: Arc<Vec<EncodedImage>>,
        photo_order: Vec<usize>,
        painting_order: Vec<usize>,
        batch_size: usize,
    ) -> Self {
        let pairs = photos.len().min(paintings.len());
        let len = pairs - pairs % batch_size.max(1);

        Self {
            photos,
            paintings,
            photo_order,
            painting_order,
            len,
        }
    }
}
impl Dataset<UnpairedItem> for UnpairedDataset {
    fn get(&self, index: usize) -> Option<UnpairedItem> {
        if index >= self.len {
            return None;
        }
        let photo = self.photos.get(self.photo_order[index])?;
        let painting = self.paintings.get(self.painting_order[index])?;

        Some(UnpairedItem {
            photo: photo.clone(),
            painting: painting.clone(),
        })
    }

    fn len(&self) -> usize {
        self.len
    }
}

// ////////////////////////////////////////////////////////////////////////////
// Batcher

#[derive(Clone, Debug)]
pub struct UnpairedBatch<B: Backend> {
    pub photos: Tensor<B, 4>,
    pub paintings: Tensor<B, 4>,
}

/// Decodes, resizes and normalizes both sides of every item identically.
#[derive(Clone, Debug)]
pub struct UnpairedBatcher {
    height: usize,
    width: usize,
}
impl UnpairedBatcher {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    fn to_tensor<B: Backend>(&self, image: &EncodedImage, device: &B::Device) -> Tensor<B, 4> {
        // Headers were validated at load; a body that still fails to decode
        // means the data changed underneath us, which is not recoverable.
        let image = image
            .decode(self.height, self.width)
            .unwrap_or_else(|err| panic!("training image failed to decode: {err}"));

        image_to_tensor::<B>(&image, device).unsqueeze_dim(0)
    }
}
impl<B: Backend> Batcher<B, UnpairedItem, UnpairedBatch<B>> for UnpairedBatcher {
    fn batch(&self, items: Vec<UnpairedItem>, device: &B::Device) -> UnpairedBatch<B> {
        let photos = items
            .iter()
            .map(|item| self.to_tensor::<B>(&item.photo, device))
            .collect::<Vec<_>>();
        let paintings = items
            .iter()
            .map(|item| self.to_tensor::<B>(&item.painting, device))
            .collect::<Vec<_>>();

        UnpairedBatch {
            photos: Tensor::cat(photos, 0),
            paintings: Tensor::cat(paintings, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::{ImageFormat, Rgb};

    type TestBackend = NdArray<f32>;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("monet-gan-data-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn png(width: u32, height: u32, shade: u8) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb([shade, shade, shade]));
        let mut bytes = Cursor::new(Vec::new());
        image.write_to(&mut bytes, ImageFormat::Png).unwrap();
        bytes.into_inner()
    }

    fn encoded(count: usize) -> Arc<Vec<EncodedImage>> {
        let images = (0..count)
            .map(|i| EncodedImage(png(4, 4, i as u8).into()))
            .collect();
        Arc::new(images)
    }

    #[test]
    fn empty_painting_domain_is_fatal() {
        let data_dir = temp_dir("empty-monet");
        std::fs::create_dir_all(data_dir.join("photo_tfrec")).unwrap();
        std::fs::write(data_dir.join("photo_tfrec/p0.tfrec"), b"").unwrap();
        std::fs::create_dir_all(data_dir.join("monet_tfrec")).unwrap();

        let err = discover(&data_dir, SourceFormat::Tfrecord).unwrap_err();

        assert!(matches!(err, Error::EmptyDomain { domain: "monet", .. }), "{err}");
    }

    #[test]
    fn empty_photo_domain_is_fatal_even_with_paintings() {
        let data_dir = temp_dir("empty-photo");
        std::fs::create_dir_all(data_dir.join("monet_tfrec")).unwrap();
        std::fs::write(data_dir.join("monet_tfrec/m0.tfrec"), b"").unwrap();

        let err = discover(&data_dir, SourceFormat::Tfrecord).unwrap_err();

        assert!(matches!(err, Error::EmptyDomain { domain: "photo", .. }), "{err}");
    }

    #[test]
    fn discovery_filters_by_extension_and_sorts() {
        let data_dir = temp_dir("discover");
        for dir in ["photo_jpg", "monet_jpg"] {
            std::fs::create_dir_all(data_dir.join(dir)).unwrap();
        }
        std::fs::write(data_dir.join("photo_jpg/b.jpg"), b"").unwrap();
        std::fs::write(data_dir.join("photo_jpg/a.PNG"), b"").unwrap();
        std::fs::write(data_dir.join("photo_jpg/notes.txt"), b"").unwrap();
        std::fs::write(data_dir.join("monet_jpg/m.jpeg"), b"").unwrap();

        let files = discover(&data_dir, SourceFormat::Images).unwrap();

        let names = files
            .photos
            .iter()
            .map(|path| path.file_name().unwrap().to_str().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(names, ["a.PNG", "b.jpg"]);
        assert_eq!(files.paintings.len(), 1);
    }

    #[test]
    fn loads_images_out_of_tfrecord_shards() {
        use crate::data::tfrecord::tests::{example, frame};

        let data_dir = temp_dir("shards");
        let path = data_dir.join("monet00.tfrec");
        let mut shard = frame(&example(&png(4, 4, 10)));
        shard.extend(frame(&example(&png(4, 4, 20))));
        std::fs::write(&path, shard).unwrap();

        let images = load_domain(&[path], SourceFormat::Tfrecord).unwrap();

        assert_eq!(images.len(), 2);
        assert_eq!(images[1].decode(4, 4).unwrap().get_pixel(0, 0), &Rgb([20, 20, 20]));
    }

    #[test]
    fn undecodable_record_fails_at_load() {
        use crate::data::tfrecord::tests::{example, frame};

        let data_dir = temp_dir("bad-image");
        let path = data_dir.join("photo00.tfrec");
        std::fs::write(&path, frame(&example(b"not an image"))).unwrap();

        let err = load_domain(&[path], SourceFormat::Tfrecord).unwrap_err();

        assert!(matches!(err, Error::Decode { index: 0, .. }), "{err}");
    }

    #[test]
    fn dataset_truncates_to_shorter_domain_and_whole_batches() {
        let dataset = UnpairedDataset::new(encoded(7), encoded(11), 2);

        assert_eq!(dataset.len(), 6);
        assert!(dataset.get(5).is_some());
        assert!(dataset.get(6).is_none());
    }

    #[test]
    fn shuffling_is_seeded() {
        let (photos, paintings) = (encoded(16), encoded(16));
        let first = UnpairedDataset::shuffled(photos.clone(), paintings.clone(), 1, 7);
        let again = UnpairedDataset::shuffled(photos.clone(), paintings.clone(), 1, 7);
        let other = UnpairedDataset::shuffled(photos, paintings, 1, 8);

        assert_eq!(first.photo_order, again.photo_order);
        assert_eq!(first.painting_order, again.painting_order);
        assert_ne!(first.photo_order, other.photo_order);
    }

    #[test]
    fn batcher_produces_equal_normalized_batches() {
        let device = Default::default();
        let dataset = UnpairedDataset::new(encoded(3), encoded(3), 3);
        let items = (0..3).filter_map(|i| dataset.get(i)).collect::<Vec<_>>();

        let batch: UnpairedBatch<TestBackend> = UnpairedBatcher::new(8, 8).batch(items, &device);

        assert_eq!(batch.photos.dims(), [3, 3, 8, 8]);
        assert_eq!(batch.photos.dims(), batch.paintings.dims());
        let values = batch.photos.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
    }
}
