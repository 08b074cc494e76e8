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

    devices::floppy_drive.rs

    Implements a floppy drive: head position, sensors, and the loaded media.
*/

#![allow(dead_code)]

use crate::device_types::disk::FloppyDisk;

/// Number of cylinders an 8" drive mechanism can address.
pub const DRIVE_CYLINDERS: u16 = 77;

/// Number of index() samples per simulated revolution and how many of them
/// report the pulse. The host only ever polls the index sensor, so a
/// counter is a sufficient stand-in for rotation.
const INDEX_SAMPLES_PER_REVOLUTION: u64 = 100;
const INDEX_PULSE_SAMPLES: u64 = 5;

pub struct FloppyDiskDrive {
    selected: bool,
    cylinder_ct: u16,
    track: u16,
    write_protected: bool,
    disk_change: bool,
    index_sample_ct: u64,
    disk: Option<FloppyDisk>,
}

impl Default for FloppyDiskDrive {
    fn default() -> Self {
        Self {
            selected: false,
            cylinder_ct: DRIVE_CYLINDERS,
            track: 0,
            write_protected: false,
            disk_change: false,
            index_sample_ct: 0,
            disk: None,
        }
    }
}

impl FloppyDiskDrive {
    pub fn new(cylinder_ct: u16) -> Self {
        Self {
            cylinder_ct,
            ..Default::default()
        }
    }

    /// Reset the drive to default state, preserving loaded media and head
    /// position. Called when the controller itself is reset.
    pub fn reset(&mut self) {
        self.selected = false;
        self.index_sample_ct = 0;
    }

    pub fn select(&mut self, selected: bool) {
        if selected != self.selected {
            log::trace!("Drive select: {}", selected);
        }
        self.selected = selected;
    }

    #[inline]
    pub fn is_selected(&self) -> bool {
        self.selected
    }

    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.disk.is_some()
    }

    pub fn is_two_sided(&self) -> bool {
        self.disk.as_ref().map_or(false, |d| d.is_two_sided())
    }

    #[inline]
    pub fn is_write_protected(&self) -> bool {
        self.write_protected
    }

    pub fn set_write_protected(&mut self, write_protected: bool) {
        self.write_protected = write_protected;
    }

    /// Disk-change line, latched on media insertion or removal.
    #[inline]
    pub fn disk_change(&self) -> bool {
        self.disk_change
    }

    pub fn clear_disk_change(&mut self) {
        self.disk_change = false;
    }

    #[inline]
    pub fn track0(&self) -> bool {
        self.track == 0
    }

    /// Index sensor. The pulse is active for a short slice of each
    /// simulated revolution, advanced one sample per query.
    pub fn index(&mut self) -> bool {
        if !self.is_loaded() {
            return false;
        }
        self.index_sample_ct = self.index_sample_ct.wrapping_add(1);
        (self.index_sample_ct % INDEX_SAMPLES_PER_REVOLUTION) < INDEX_PULSE_SAMPLES
    }

    /// Physical cylinder the head is over.
    #[inline]
    pub fn track(&self) -> u16 {
        self.track
    }

    /// Move the head directly to the given cylinder, clamped to the drive's
    /// physical range.
    pub fn seek_to(&mut self, cylinder: u16) {
        self.track = cylinder.min(self.cylinder_ct - 1);
    }

    /// Step the head one cylinder. The mechanism stops at its physical
    /// limits without complaint, like the real hardware.
    pub fn step(&mut self, inward: bool) {
        if inward {
            if self.track + 1 < self.cylinder_ct {
                self.track += 1;
            }
        }
        else if self.track > 0 {
            self.track -= 1;
        }
    }

    /// Insert media. Latches the disk-change line.
    pub fn load_disk(&mut self, disk: FloppyDisk, write_protect: bool) {
        log::debug!("Media loaded, write protect: {}", write_protect);
        self.disk = Some(disk);
        self.write_protected = write_protect;
        self.disk_change = true;
    }

    /// Eject media. Latches the disk-change line.
    pub fn unload_disk(&mut self) -> Option<FloppyDisk> {
        self.disk_change = true;
        self.disk.take()
    }

    pub fn disk(&self) -> Option<&FloppyDisk> {
        self.disk.as_ref()
    }

    pub fn disk_mut(&mut self) -> Option<&mut FloppyDisk> {
        self.disk.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_types::disk::{FloppyDisk, TrackFormat};

    #[test]
    fn step_clamps_at_mechanism_limits() {
        let mut drive = FloppyDiskDrive::default();
        drive.step(false);
        assert_eq!(drive.track(), 0);
        assert!(drive.track0());

        drive.seek_to(DRIVE_CYLINDERS + 10);
        assert_eq!(drive.track(), DRIVE_CYLINDERS - 1);
        drive.step(true);
        assert_eq!(drive.track(), DRIVE_CYLINDERS - 1);

        drive.step(false);
        assert_eq!(drive.track(), DRIVE_CYLINDERS - 2);
        assert!(!drive.track0());
    }

    #[test]
    fn media_changes_latch_disk_change() {
        let mut drive = FloppyDiskDrive::default();
        assert!(!drive.disk_change());
        assert!(!drive.is_loaded());

        drive.load_disk(FloppyDisk::blank(77, 2), false);
        assert!(drive.disk_change());
        assert!(drive.is_loaded());
        assert!(drive.is_two_sided());

        drive.clear_disk_change();
        assert!(!drive.disk_change());

        drive.unload_disk();
        assert!(drive.disk_change());
        assert!(!drive.is_loaded());
        assert!(!drive.is_two_sided());
    }

    #[test]
    fn index_pulses_only_with_media() {
        let mut drive = FloppyDiskDrive::default();
        assert!(!drive.index());

        let mut disk = FloppyDisk::blank(77, 1);
        disk.format_track(TrackFormat::Fm500, 0, 0, 26, 128);
        drive.load_disk(disk, false);

        // The pulse must assert at least once over a full revolution of
        // samples.
        let seen = (0..200).any(|_| drive.index());
        assert!(seen);
    }
}
