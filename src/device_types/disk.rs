/*
    iop_core
    https://github.com/dbalsom/iop_core

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    device_types::disk.rs

    Sector-mapped floppy disk model.

    A disk is a grid of tracks addressed by (cylinder, head); each track
    carries its recording format and a run of fixed-size sectors. Tracks are
    independently formattable, which is how WriteTrack output lands on the
    media.
*/

#![allow(dead_code)]

use std::fmt::Display;

use anyhow::{anyhow, Error};
use lazy_static::lazy_static;
use std::collections::HashMap;

/// Low-level recording format of a single track. The controller supports
/// FM and MFM at 500 kbit/s; anything else on a track surfaces as a CRC
/// error during a transfer.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum TrackFormat {
    #[default]
    Unformatted,
    Fm500,
    Mfm500,
}

impl Display for TrackFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackFormat::Unformatted => write!(f, "Unformatted"),
            TrackFormat::Fm500 => write!(f, "FM-500"),
            TrackFormat::Mfm500 => write!(f, "MFM-500"),
        }
    }
}

/// Geometry of a standard disk image, looked up by image size on load.
#[derive(Copy, Clone, Debug)]
pub struct DiskGeometry {
    pub format: TrackFormat,
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
    pub sector_size: usize,
}

lazy_static! {
    /// Flat image sizes we know how to interpret, keyed by byte length.
    /// 8" formats: IBM 3740 style FM single density and the 256-byte MFM
    /// double density layouts, single and double sided.
    pub static ref DISK_GEOMETRIES: HashMap<usize, DiskGeometry> = {
        HashMap::from([
            (
                256_256,
                DiskGeometry {
                    format: TrackFormat::Fm500,
                    cylinders: 77,
                    heads: 1,
                    sectors: 26,
                    sector_size: 128,
                },
            ),
            (
                512_512,
                DiskGeometry {
                    format: TrackFormat::Mfm500,
                    cylinders: 77,
                    heads: 1,
                    sectors: 26,
                    sector_size: 256,
                },
            ),
            (
                1_025_024,
                DiskGeometry {
                    format: TrackFormat::Mfm500,
                    cylinders: 77,
                    heads: 2,
                    sectors: 26,
                    sector_size: 256,
                },
            ),
        ])
    };
}

/// A single sector's backing store.
#[derive(Clone, Debug, Default)]
pub struct Sector {
    pub data: Vec<u8>,
}

impl Sector {
    pub fn new(size: usize) -> Self {
        Self { data: vec![0; size] }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One formatted track: a recording format and its sectors, stored in
/// physical order. Sector IDs are 1-based on the wire; index with id - 1.
#[derive(Clone, Debug, Default)]
pub struct Track {
    pub format: TrackFormat,
    sectors: Vec<Sector>,
}

impl Track {
    pub fn new(format: TrackFormat, sector_count: u8, sector_size: usize) -> Self {
        Self {
            format,
            sectors: (0..sector_count).map(|_| Sector::new(sector_size)).collect(),
        }
    }

    #[inline]
    pub fn sector_count(&self) -> u8 {
        self.sectors.len() as u8
    }

    /// Declared sector size of the track. All sectors on a track share one
    /// size; an unformatted track reports zero.
    pub fn sector_size(&self) -> usize {
        self.sectors.first().map_or(0, |s| s.len())
    }

    pub fn sector(&self, sector_zero_index: u8) -> Option<&Sector> {
        self.sectors.get(sector_zero_index as usize)
    }

    pub fn sector_mut(&mut self, sector_zero_index: u8) -> Option<&mut Sector> {
        self.sectors.get_mut(sector_zero_index as usize)
    }
}

/// Sector-mapped disk. Owns every track surface; mutation is tracked via the
/// modified flag so the enclosing emulator knows when to flush the image.
pub struct FloppyDisk {
    cylinders: u16,
    heads: u8,
    tracks: Vec<Track>,
    modified: bool,
}

impl FloppyDisk {
    /// Create an unformatted disk with the given number of track surfaces.
    pub fn blank(cylinders: u16, heads: u8) -> Self {
        Self {
            cylinders,
            heads,
            tracks: vec![Track::default(); cylinders as usize * heads as usize],
            modified: false,
        }
    }

    /// Create a fully formatted, zero-filled disk.
    pub fn formatted(geometry: DiskGeometry) -> Self {
        let mut disk = Self::blank(geometry.cylinders, geometry.heads);
        for c in 0..geometry.cylinders {
            for h in 0..geometry.heads {
                disk.format_track(geometry.format, c, h, geometry.sectors, geometry.sector_size);
            }
        }
        disk.modified = false;
        disk
    }

    /// Interpret a flat sector-ordered image, detecting geometry by length.
    pub fn from_image(src: &[u8]) -> Result<Self, Error> {
        let geometry = DISK_GEOMETRIES
            .get(&src.len())
            .ok_or_else(|| anyhow!("Unrecognized image length: {}", src.len()))?;

        let mut disk = Self::formatted(*geometry);
        let mut offset = 0;
        for c in 0..geometry.cylinders {
            for h in 0..geometry.heads {
                let track = disk.track_mut(c, h).unwrap();
                for s in 0..geometry.sectors {
                    let sector = track.sector_mut(s).unwrap();
                    sector.data.copy_from_slice(&src[offset..offset + geometry.sector_size]);
                    offset += geometry.sector_size;
                }
            }
        }
        disk.modified = false;

        log::debug!(
            "Loaded floppy image, size: {} geometry: c:{} h:{} s:{} {}",
            src.len(),
            geometry.cylinders,
            geometry.heads,
            geometry.sectors,
            geometry.format
        );

        Ok(disk)
    }

    #[inline]
    pub fn cylinders(&self) -> u16 {
        self.cylinders
    }

    #[inline]
    pub fn heads(&self) -> u8 {
        self.heads
    }

    pub fn is_two_sided(&self) -> bool {
        self.heads > 1
    }

    fn track_index(&self, cylinder: u16, head: u8) -> Option<usize> {
        if cylinder >= self.cylinders || head >= self.heads {
            return None;
        }
        Some(cylinder as usize * self.heads as usize + head as usize)
    }

    pub fn track(&self, cylinder: u16, head: u8) -> Option<&Track> {
        self.track_index(cylinder, head).map(|i| &self.tracks[i])
    }

    pub fn track_mut(&mut self, cylinder: u16, head: u8) -> Option<&mut Track> {
        self.track_index(cylinder, head).map(move |i| &mut self.tracks[i])
    }

    pub fn sector(&self, cylinder: u16, head: u8, sector_zero_index: u8) -> Option<&Sector> {
        self.track(cylinder, head).and_then(|t| t.sector(sector_zero_index))
    }

    pub fn sector_mut(&mut self, cylinder: u16, head: u8, sector_zero_index: u8) -> Option<&mut Sector> {
        self.track_mut(cylinder, head).and_then(|t| t.sector_mut(sector_zero_index))
    }

    /// Replace a track surface with freshly formatted, zero-filled sectors.
    pub fn format_track(
        &mut self,
        format: TrackFormat,
        cylinder: u16,
        head: u8,
        sector_count: u8,
        sector_size: usize,
    ) {
        if let Some(i) = self.track_index(cylinder, head) {
            log::debug!(
                "format_track: {} c:{} h:{} sectors:{} size:{}",
                format,
                cylinder,
                head,
                sector_count,
                sector_size
            );
            self.tracks[i] = Track::new(format, sector_count, sector_size);
            self.modified = true;
        }
        else {
            log::warn!("format_track: track c:{} h:{} out of range", cylinder, head);
        }
    }

    pub fn set_modified(&mut self) {
        self.modified = true;
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_geometry_is_detected_by_length() {
        let disk = FloppyDisk::from_image(&vec![0u8; 256_256]).unwrap();
        assert_eq!(disk.cylinders(), 77);
        assert_eq!(disk.heads(), 1);
        assert_eq!(disk.track(0, 0).unwrap().format, TrackFormat::Fm500);
        assert_eq!(disk.track(0, 0).unwrap().sector_count(), 26);
        assert_eq!(disk.track(0, 0).unwrap().sector_size(), 128);

        assert!(FloppyDisk::from_image(&vec![0u8; 100]).is_err());
    }

    #[test]
    fn image_bytes_land_in_sector_order() {
        let mut src = vec![0u8; 512_512];
        // First byte of each of the first three sectors of track 0.
        src[0] = 0xAA;
        src[256] = 0xBB;
        src[512] = 0xCC;

        let disk = FloppyDisk::from_image(&src).unwrap();
        assert_eq!(disk.sector(0, 0, 0).unwrap().data[0], 0xAA);
        assert_eq!(disk.sector(0, 0, 1).unwrap().data[0], 0xBB);
        assert_eq!(disk.sector(0, 0, 2).unwrap().data[0], 0xCC);
        assert!(!disk.is_modified());
    }

    #[test]
    fn format_track_replaces_surface_and_marks_modified() {
        let mut disk = FloppyDisk::blank(77, 2);
        assert!(disk.track(5, 1).unwrap().format == TrackFormat::Unformatted);
        assert_eq!(disk.track(5, 1).unwrap().sector_count(), 0);

        disk.format_track(TrackFormat::Mfm500, 5, 1, 9, 512);

        let track = disk.track(5, 1).unwrap();
        assert_eq!(track.format, TrackFormat::Mfm500);
        assert_eq!(track.sector_count(), 9);
        assert_eq!(track.sector_size(), 512);
        assert!(disk.is_modified());

        // Other surfaces untouched.
        assert_eq!(disk.track(5, 0).unwrap().sector_count(), 0);
    }

    #[test]
    fn sector_access_is_bounds_checked() {
        let mut disk = FloppyDisk::blank(77, 1);
        disk.format_track(TrackFormat::Fm500, 0, 0, 26, 128);

        assert!(disk.sector(0, 0, 25).is_some());
        assert!(disk.sector(0, 0, 26).is_none());
        assert!(disk.sector(0, 1, 0).is_none());
        assert!(disk.sector(77, 0, 0).is_none());
    }
}
