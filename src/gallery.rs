//! On-disk photo store and its in-memory chronological index
//!
//! Photos are named `photo_YYYYMMDD_HHMMSS.jpg`. Two captures within the
//! same second get a numeric suffix (`photo_YYYYMMDD_HHMMSS_1.jpg`) instead
//! of overwriting each other. The filesystem owns the files; the index only
//! orders them for listing and navigation.

use chrono::NaiveDateTime;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::ControlError;

const NAME_PREFIX: &str = "photo_";
const NAME_EXTENSION: &str = ".jpg";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const TIMESTAMP_LEN: usize = 15;

const DEFAULT_PER_PAGE: usize = 24;
const MAX_PER_PAGE: usize = 200;

/// A stored photo
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhotoAsset {
    pub name: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub timestamp: NaiveDateTime,
    /// Position in chronological order of discovery or creation
    pub sequence: u64,
    pub size_bytes: u64,
    #[serde(skip)]
    collision_suffix: u32,
}

impl PhotoAsset {
    fn order_key(&self) -> (NaiveDateTime, u32) {
        (self.timestamp, self.collision_suffix)
    }
}

/// Name and path reserved for a capture that has not been written yet
#[derive(Debug, Clone)]
pub struct ReservedPhoto {
    pub name: String,
    pub path: PathBuf,
    timestamp: NaiveDateTime,
    collision_suffix: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GalleryDirection {
    Older,
    Newer,
    Oldest,
    Newest,
}

/// Where the local gallery cursor points after navigation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GalleryPosition {
    /// Chronological index (0 = oldest), `None` when the gallery is empty
    pub index: Option<usize>,
    pub total: usize,
    pub asset: Option<PhotoAsset>,
    pub at_oldest: bool,
    pub at_newest: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Newest,
    Oldest,
}

/// Paginated listing request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub per_page: Option<usize>,
    #[serde(default)]
    pub order: SortOrder,
}

#[derive(Debug, Clone, Serialize)]
pub struct GalleryPage {
    pub items: Vec<PhotoAsset>,
    pub page: usize,
    pub per_page: usize,
    pub pages: usize,
    pub total: usize,
    pub order: SortOrder,
}

struct GalleryState {
    /// Oldest first
    assets: Vec<PhotoAsset>,
    next_sequence: u64,
    cursor: usize,
}

/// Photo directory plus index.
///
/// Creation and deletion only happen from the camera controller; HTTP
/// handlers read concurrently.
pub struct Gallery {
    dir: PathBuf,
    state: RwLock<GalleryState>,
}

/// Split `photo_YYYYMMDD_HHMMSS[_N].jpg` into timestamp and suffix
pub fn parse_photo_name(name: &str) -> Option<(NaiveDateTime, u32)> {
    let stem = name
        .strip_prefix(NAME_PREFIX)?
        .strip_suffix(NAME_EXTENSION)?;
    if !stem.is_ascii() || stem.len() < TIMESTAMP_LEN {
        return None;
    }

    let (stamp, rest) = stem.split_at(TIMESTAMP_LEN);
    let suffix = if rest.is_empty() {
        0
    } else {
        let digits = rest.strip_prefix('_')?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()?
    };

    let timestamp = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
    Some((timestamp, suffix))
}

pub fn photo_name(timestamp: NaiveDateTime, suffix: u32) -> String {
    let stamp = timestamp.format(TIMESTAMP_FORMAT);
    if suffix == 0 {
        format!("{}{}{}", NAME_PREFIX, stamp, NAME_EXTENSION)
    } else {
        format!("{}{}_{}{}", NAME_PREFIX, stamp, suffix, NAME_EXTENSION)
    }
}

/// Reject anything that is not a gallery file name (path traversal included)
pub fn validate_name(name: &str) -> Result<(), ControlError> {
    parse_photo_name(name)
        .map(|_| ())
        .ok_or_else(|| ControlError::InvalidValue(format!("not a photo name: {}", name)))
}

impl Gallery {
    /// Open (and create if needed) the photo directory and index it
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let gallery = Gallery {
            dir,
            state: RwLock::new(GalleryState {
                assets: Vec::new(),
                next_sequence: 1,
                cursor: 0,
            }),
        };
        let count = gallery.rescan()?;
        info!(dir = %gallery.dir.display(), photos = count, "Gallery indexed");
        Ok(gallery)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rebuild the index from the directory contents
    pub fn rescan(&self) -> io::Result<usize> {
        let mut assets = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some((timestamp, collision_suffix)) = parse_photo_name(&name) else {
                debug!(file = %name, "Skipping non-photo file");
                continue;
            };
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            assets.push(PhotoAsset {
                name,
                path: entry.path(),
                timestamp,
                sequence: 0,
                size_bytes: metadata.len(),
                collision_suffix,
            });
        }
        assets.sort_by_key(|a| a.order_key());

        let mut state = self.state.write();
        for (i, asset) in assets.iter_mut().enumerate() {
            asset.sequence = i as u64 + 1;
        }
        state.next_sequence = assets.len() as u64 + 1;
        state.cursor = assets.len().saturating_sub(1);
        state.assets = assets;
        Ok(state.assets.len())
    }

    /// Pick a free name for a capture taken at `taken_at`
    pub fn reserve(&self, taken_at: NaiveDateTime) -> ReservedPhoto {
        let state = self.state.read();
        let mut suffix = 0;
        loop {
            let name = photo_name(taken_at, suffix);
            let path = self.dir.join(&name);
            let indexed = state.assets.iter().any(|a| a.name == name);
            if !indexed && !path.exists() {
                return ReservedPhoto {
                    name,
                    path,
                    timestamp: taken_at,
                    collision_suffix: suffix,
                };
            }
            suffix += 1;
        }
    }

    /// Add a written photo to the index; the cursor moves to it
    pub fn commit(&self, reserved: ReservedPhoto, size_bytes: u64) -> PhotoAsset {
        let mut state = self.state.write();
        let asset = PhotoAsset {
            name: reserved.name,
            path: reserved.path,
            timestamp: reserved.timestamp,
            sequence: state.next_sequence,
            size_bytes,
            collision_suffix: reserved.collision_suffix,
        };
        state.next_sequence += 1;

        let key = asset.order_key();
        let index = state.assets.partition_point(|a| a.order_key() <= key);
        state.assets.insert(index, asset.clone());
        state.cursor = index;
        asset
    }

    pub fn get(&self, name: &str) -> Option<PhotoAsset> {
        self.state.read().assets.iter().find(|a| a.name == name).cloned()
    }

    /// Drop an asset from the index (the caller removes the file)
    pub fn remove(&self, name: &str) -> Option<PhotoAsset> {
        let mut state = self.state.write();
        let index = state.assets.iter().position(|a| a.name == name)?;
        let asset = state.assets.remove(index);
        if index < state.cursor {
            state.cursor -= 1;
        }
        state.cursor = state.cursor.min(state.assets.len().saturating_sub(1));
        Some(asset)
    }

    pub fn len(&self) -> usize {
        self.state.read().assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self, query: &ListQuery) -> GalleryPage {
        let per_page = query
            .per_page
            .unwrap_or(DEFAULT_PER_PAGE)
            .clamp(1, MAX_PER_PAGE);
        let page = query.page.unwrap_or(1).max(1);

        let state = self.state.read();
        let total = state.assets.len();
        let skip = (page - 1).saturating_mul(per_page);

        let items: Vec<PhotoAsset> = match query.order {
            SortOrder::Newest => state.assets.iter().rev().skip(skip).take(per_page).cloned().collect(),
            SortOrder::Oldest => state.assets.iter().skip(skip).take(per_page).cloned().collect(),
        };

        GalleryPage {
            items,
            page,
            per_page,
            pages: total.div_ceil(per_page),
            total,
            order: query.order,
        }
    }

    /// Move the local cursor. Navigation clamps at both ends.
    pub fn navigate(&self, direction: GalleryDirection) -> GalleryPosition {
        let mut state = self.state.write();
        let len = state.assets.len();
        if len > 0 {
            state.cursor = match direction {
                GalleryDirection::Older => state.cursor.saturating_sub(1),
                GalleryDirection::Newer => (state.cursor + 1).min(len - 1),
                GalleryDirection::Oldest => 0,
                GalleryDirection::Newest => len - 1,
            };
        }
        Self::position_of(&state)
    }

    pub fn position(&self) -> GalleryPosition {
        Self::position_of(&self.state.read())
    }

    fn position_of(state: &GalleryState) -> GalleryPosition {
        let total = state.assets.len();
        if total == 0 {
            return GalleryPosition {
                index: None,
                total,
                asset: None,
                at_oldest: true,
                at_newest: true,
            };
        }
        GalleryPosition {
            index: Some(state.cursor),
            total,
            asset: state.assets.get(state.cursor).cloned(),
            at_oldest: state.cursor == 0,
            at_newest: state.cursor + 1 == total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 17)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn store(gallery: &Gallery, taken_at: NaiveDateTime) -> PhotoAsset {
        let reserved = gallery.reserve(taken_at);
        fs::write(&reserved.path, b"jpeg").unwrap();
        gallery.commit(reserved, 4)
    }

    #[test]
    fn test_photo_name_roundtrip() {
        assert_eq!(photo_name(at(9, 5, 1), 0), "photo_20240517_090501.jpg");
        assert_eq!(photo_name(at(9, 5, 1), 2), "photo_20240517_090501_2.jpg");
        assert_eq!(
            parse_photo_name("photo_20240517_090501_2.jpg"),
            Some((at(9, 5, 1), 2))
        );
    }

    #[test]
    fn test_rejects_foreign_names() {
        for name in [
            "../photo_20240517_090501.jpg",
            "photo_20240517_090501.png",
            "photo_2024_090501.jpg",
            "photo_20240517_090501_.jpg",
            "photo_20240517_090501_1/../../etc.jpg",
            "notes.txt",
        ] {
            assert!(validate_name(name).is_err(), "{} accepted", name);
        }
    }

    #[test]
    fn test_same_second_captures_get_suffix() {
        let dir = TempDir::new().unwrap();
        let gallery = Gallery::open(dir.path()).unwrap();

        let a = store(&gallery, at(12, 0, 0));
        let b = store(&gallery, at(12, 0, 0));
        let c = store(&gallery, at(12, 0, 0));

        assert_eq!(a.name, "photo_20240517_120000.jpg");
        assert_eq!(b.name, "photo_20240517_120000_1.jpg");
        assert_eq!(c.name, "photo_20240517_120000_2.jpg");
        assert!(a.sequence < b.sequence && b.sequence < c.sequence);
        assert_eq!(fs::read(&a.path).unwrap(), b"jpeg");
    }

    #[test]
    fn test_reserve_skips_unindexed_files_on_disk() {
        let dir = TempDir::new().unwrap();
        let gallery = Gallery::open(dir.path()).unwrap();
        fs::write(dir.path().join(photo_name(at(8, 0, 0), 0)), b"x").unwrap();

        let reserved = gallery.reserve(at(8, 0, 0));
        assert_eq!(reserved.name, "photo_20240517_080000_1.jpg");
    }

    #[test]
    fn test_scan_orders_chronologically() {
        let dir = TempDir::new().unwrap();
        for name in [
            "photo_20240517_120000.jpg",
            "photo_20240516_235959.jpg",
            "photo_20240517_120000_1.jpg",
            "readme.txt",
        ] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let gallery = Gallery::open(dir.path()).unwrap();
        assert_eq!(gallery.len(), 3);

        let page = gallery.list(&ListQuery {
            order: SortOrder::Oldest,
            ..Default::default()
        });
        let names: Vec<_> = page.items.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "photo_20240516_235959.jpg",
                "photo_20240517_120000.jpg",
                "photo_20240517_120000_1.jpg"
            ]
        );
        assert_eq!(page.items[0].sequence, 1);
    }

    #[test]
    fn test_list_paginates_newest_first() {
        let dir = TempDir::new().unwrap();
        let gallery = Gallery::open(dir.path()).unwrap();
        for s in 0..5 {
            store(&gallery, at(10, 0, s));
        }

        let page = gallery.list(&ListQuery {
            page: Some(2),
            per_page: Some(2),
            order: SortOrder::Newest,
        });
        assert_eq!(page.total, 5);
        assert_eq!(page.pages, 3);
        let names: Vec<_> = page.items.iter().map(|a| a.name.clone()).collect();
        assert_eq!(
            names,
            vec![photo_name(at(10, 0, 2), 0), photo_name(at(10, 0, 1), 0)]
        );

        let beyond = gallery.list(&ListQuery {
            page: Some(9),
            per_page: Some(2),
            order: SortOrder::Newest,
        });
        assert!(beyond.items.is_empty());
    }

    #[test]
    fn test_navigation_clamps_at_both_ends() {
        let dir = TempDir::new().unwrap();
        let gallery = Gallery::open(dir.path()).unwrap();

        let empty = gallery.navigate(GalleryDirection::Older);
        assert_eq!(empty.index, None);
        assert_eq!(empty.total, 0);

        for s in 0..3 {
            store(&gallery, at(11, 0, s));
        }
        // cursor follows the latest capture
        assert_eq!(gallery.position().index, Some(2));

        let pos = gallery.navigate(GalleryDirection::Newer);
        assert_eq!(pos.index, Some(2));
        assert!(pos.at_newest);

        gallery.navigate(GalleryDirection::Older);
        gallery.navigate(GalleryDirection::Older);
        let pos = gallery.navigate(GalleryDirection::Older);
        assert_eq!(pos.index, Some(0));
        assert!(pos.at_oldest);
        assert_eq!(pos.asset.unwrap().name, photo_name(at(11, 0, 0), 0));

        let pos = gallery.navigate(GalleryDirection::Newest);
        assert_eq!(pos.index, Some(2));
    }

    #[test]
    fn test_remove_keeps_cursor_in_range() {
        let dir = TempDir::new().unwrap();
        let gallery = Gallery::open(dir.path()).unwrap();
        let first = store(&gallery, at(7, 0, 0));
        let last = store(&gallery, at(7, 0, 1));

        assert!(gallery.remove(&last.name).is_some());
        assert_eq!(gallery.position().index, Some(0));
        assert!(gallery.remove(&last.name).is_none());

        gallery.remove(&first.name);
        assert_eq!(gallery.position().index, None);
        assert!(gallery.is_empty());
    }
}
