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

    devices::fdc::mod.rs

    Implements the Western Digital FD1797 Floppy Disk Controller, together
    with the external state/status latches the I/O processor wraps around it.

    Command writes are decoded into one of the FD1797 command families and
    executed through scheduled events; sector transfers feed either the DMA
    engine or programmed IO on the data register; WriteTrack output is
    collected and parsed back into a sector layout by the write_track module.
*/

#![allow(dead_code)]

use modular_bitfield::{bitfield, prelude::*};

use crate::{
    bus::{DeviceError, IoDevice},
    device_types::disk::TrackFormat,
    devices::floppy_drive::FloppyDiskDrive,
    interrupt::ExternalInterrupt,
    scheduler::{DeviceContext, EventScheduler},
};

pub mod write_track;
pub use write_track::WRITE_TRACK_BUFFER_SIZE;
use write_track::parse_track_stream;

pub const FDC_COMMAND_REGISTER: u16 = 0x84;
pub const FDC_STATUS_REGISTER: u16 = 0x84;
pub const FDC_TRACK_REGISTER: u16 = 0x85;
pub const FDC_SECTOR_REGISTER: u16 = 0x86;
pub const FDC_DATA_REGISTER: u16 = 0x87;
pub const EXTERNAL_STATE_PORT: u16 = 0xE8;

/// Latency between a command register write and the command starting work.
pub const COMMAND_ACCEPT_TIME_NS: u64 = 12_000;
/// Head step time, per cylinder.
pub const STEP_TIME_NS: u64 = 6_000_000;
/// How long the pseudo-index override stays asserted after chip enable.
/// Undocumented FD1797 behaviour that the I/O processor diagnostic depends
/// on; the duration is a guess.
pub const INDEX_RESET_TIME_NS: u64 = 10_000_000;
/// One disk revolution at 300 RPM. A WriteTrack ends at the index hole, one
/// revolution after it begins.
pub const ROTATION_TIME_NS: u64 = 200_000_000;

/// The DRQ pulse seen by the DMA engine is modelled as a countdown: every
/// drq() query decrements it and only the query that reaches zero reports
/// the request. The DMA engine polls far faster than the real data rate, so
/// this paces transfers to something plausible without costing wall-clock
/// performance.
pub const DRQ_PACING_COUNT: u8 = 16;

// Status register bits. Several positions are shared between the command
// families and carry a different meaning in each; the synthesizer picks the
// applicable set from the family of the last command.
pub const STATUS_NOT_READY: u8 = 0b1000_0000;
pub const STATUS_WRITE_PROTECT: u8 = 0b0100_0000;
pub const STATUS_HEAD_LOADED: u8 = 0b0010_0000; // Type I
pub const STATUS_RECORD_TYPE: u8 = 0b0010_0000; // Type II/III writes
pub const STATUS_SEEK_ERROR: u8 = 0b0001_0000; // Type I
pub const STATUS_RECORD_NOT_FOUND: u8 = 0b0001_0000; // Type II/III
pub const STATUS_CRC_ERROR: u8 = 0b0000_1000;
pub const STATUS_TRACK0: u8 = 0b0000_0100; // Type I
pub const STATUS_LOST_DATA: u8 = 0b0000_0100; // Type II/III
pub const STATUS_INDEX: u8 = 0b0000_0010; // Type I
pub const STATUS_DRQ: u8 = 0b0000_0010; // Type II/III
pub const STATUS_BUSY: u8 = 0b0000_0001;

// External status byte bits.
pub const EXT_STATUS_DMA_TC: u8 = 0b0000_0001;
pub const EXT_STATUS_TWO_SIDED: u8 = 0b0000_0010;
pub const EXT_STATUS_DISK_CHANGE: u8 = 0b0100_0000;
pub const EXT_STATUS_NOT_LOADED: u8 = 0b1000_0000;

/// External state latch, write side. The latch is the only path host
/// software has to reset the FDC: the chip-enable bit edges drive the
/// enable/disable logic in handle_external_state_write().
#[bitfield]
#[derive(Copy, Clone)]
pub struct StateLatch {
    pub wait_enable: bool,
    pub precomp: bool,
    pub double_density: bool,
    pub side_select: B1,
    pub fdc_enable: bool,
    pub drive_select: bool,
    #[skip]
    unused: B2,
}

/// Parameter bits of a Type I command byte.
#[bitfield]
#[derive(Copy, Clone)]
pub struct TypeIFlags {
    pub step_rate: B2,
    pub verify: bool,
    pub head_load: bool,
    pub update: bool,
    #[skip]
    unused: B3,
}

/// Parameter bits of a Type II/III command byte. Only the side select is
/// acted upon; the rest are latched by the real chip but have no effect at
/// this level of emulation.
#[bitfield]
#[derive(Copy, Clone)]
pub struct TypeIIFlags {
    pub data_mark: bool,
    pub side: B1,
    pub delay: bool,
    pub long_sector: bool,
    #[skip]
    unused: B4,
}

/// The FD1797 command families, as selected by the high nibble of the
/// command byte. The multi-sector and address/track read variants are
/// recognized so that status reads present the right bit layout, but their
/// execution is not emulated.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Command {
    #[default]
    Restore,
    Seek,
    Step,
    StepIn,
    StepOut,
    ReadSector,
    ReadSectorMultiple,
    WriteSector,
    WriteSectorMultiple,
    ReadAddress,
    ForceInterrupt,
    ReadTrack,
    WriteTrack,
}

impl Command {
    fn decode(byte: u8) -> Command {
        match byte >> 4 {
            0x00 => Command::Restore,
            0x01 => Command::Seek,
            0x02 | 0x03 => Command::Step,
            0x04 | 0x05 => Command::StepIn,
            0x06 | 0x07 => Command::StepOut,
            0x08 => Command::ReadSector,
            0x09 => Command::ReadSectorMultiple,
            0x0A => Command::WriteSector,
            0x0B => Command::WriteSectorMultiple,
            0x0C => Command::ReadAddress,
            0x0D => Command::ForceInterrupt,
            0x0E => Command::ReadTrack,
            _ => Command::WriteTrack,
        }
    }
}

/// The in-flight command, held in a single slot. Scheduled events carry a
/// generation token and match against this slot before acting, which makes
/// ForceInterrupt and command turnover safe without cancelling anything in
/// the scheduler.
#[derive(Copy, Clone, Debug, Default)]
pub enum Operation {
    #[default]
    None,
    TypeI {
        kind: Command,
        target: u8,
        update: bool,
        verify: bool,
        head_load: bool,
    },
    Transfer {
        write: bool,
        side: u8,
    },
    WriteTrack {
        side: u8,
        double_density: bool,
        track: u8,
    },
}

/// Scheduled event token for the FDC. `seq` is the command generation the
/// event belongs to; events from a superseded generation are ignored.
#[derive(Copy, Clone, Debug)]
pub struct FdcEvent {
    pub seq: u64,
    pub kind: FdcEventKind,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FdcEventKind {
    /// Type I worker tick: one head step, or completion.
    StepTick,
    /// Sector transfer entry, after command-accept latency.
    TransferEntry,
    /// WriteTrack entry, after command-accept latency.
    WriteTrackEntry,
    /// The index hole passing the sensor, ending a WriteTrack.
    WriteTrackIndex,
    /// End of the pseudo-index override asserted at chip enable.
    IndexResetExpiry,
}

pub struct FloppyController {
    // FDC register file.
    track: u8,
    sector: u8,
    data: u8,

    // External latch state.
    latch: u8,
    double_density: bool,
    side_select: u8,
    dma_tc: bool,

    // Controller flags.
    fdc_enabled: bool,
    busy: bool,
    drq: bool,
    drq_pace: u8,
    crc_error: bool,
    seek_error: bool,
    head_loaded: bool,
    record_type: bool,
    record_not_found: bool,
    lost_data: bool,
    command_abort: bool,
    index_reset: bool,
    pending_interrupt: bool,
    send_interrupt: bool,

    // Command state.
    command: Command,
    operation: Operation,
    command_seq: u64,
    step_inward: bool,
    master_reset: bool,

    // Transfer state. The sector buffer exists only while a transfer is in
    // flight; the write-track buffer only while a WriteTrack is in flight.
    xfer_buffer: Option<Vec<u8>>,
    xfer_index: usize,
    xfer_cylinder: u16,
    xfer_head: u8,
    xfer_sector_ix: u8,
    wt_buffer: Option<Vec<u8>>,

    drive: FloppyDiskDrive,
}

impl IoDevice for FloppyController {
    fn read_u8(&mut self, port: u16) -> Result<u8, DeviceError> {
        match port {
            FDC_STATUS_REGISTER => Ok(self.handle_status_register_read()),
            FDC_TRACK_REGISTER => Ok(self.track),
            FDC_SECTOR_REGISTER => Ok(self.sector),
            FDC_DATA_REGISTER => Ok(self.handle_data_register_read()),
            EXTERNAL_STATE_PORT => Ok(self.handle_external_status_read()),
            _ => Err(DeviceError::UnexpectedPort(port)),
        }
    }

    fn write_u8(&mut self, port: u16, data: u8, scheduler: &mut EventScheduler) -> Result<(), DeviceError> {
        match port {
            FDC_COMMAND_REGISTER => self.handle_command_register_write(data, scheduler),
            FDC_TRACK_REGISTER => {
                log::trace!("Track register set: {}", data);
                self.track = data;
                Ok(())
            }
            FDC_SECTOR_REGISTER => {
                log::trace!("Sector register set: {}", data);
                self.sector = data;
                Ok(())
            }
            FDC_DATA_REGISTER => {
                self.handle_data_register_write(data);
                Ok(())
            }
            EXTERNAL_STATE_PORT => {
                self.handle_external_state_write(data, scheduler);
                Ok(())
            }
            _ => Err(DeviceError::UnexpectedPort(port)),
        }
    }

    fn read_ports(&self) -> Vec<(String, u16)> {
        vec![
            (String::from("FDC Status Register"), FDC_STATUS_REGISTER),
            (String::from("FDC Track Register"), FDC_TRACK_REGISTER),
            (String::from("FDC Sector Register"), FDC_SECTOR_REGISTER),
            (String::from("FDC Data Register"), FDC_DATA_REGISTER),
            (String::from("External Status"), EXTERNAL_STATE_PORT),
        ]
    }

    fn write_ports(&self) -> Vec<(String, u16)> {
        vec![
            (String::from("FDC Command Register"), FDC_COMMAND_REGISTER),
            (String::from("FDC Track Register"), FDC_TRACK_REGISTER),
            (String::from("FDC Sector Register"), FDC_SECTOR_REGISTER),
            (String::from("FDC Data Register"), FDC_DATA_REGISTER),
            (String::from("External State Latch"), EXTERNAL_STATE_PORT),
        ]
    }
}

impl FloppyController {
    pub fn new(drive: FloppyDiskDrive) -> Self {
        Self {
            track: 0,
            sector: 0,
            data: 0,
            latch: 0,
            double_density: false,
            side_select: 0,
            dma_tc: false,
            fdc_enabled: false,
            busy: false,
            drq: false,
            drq_pace: DRQ_PACING_COUNT,
            crc_error: false,
            seek_error: false,
            head_loaded: false,
            record_type: false,
            record_not_found: false,
            lost_data: false,
            command_abort: false,
            index_reset: false,
            pending_interrupt: false,
            send_interrupt: false,
            command: Command::Restore,
            operation: Operation::None,
            command_seq: 0,
            step_inward: true,
            master_reset: false,
            xfer_buffer: None,
            xfer_index: 0,
            xfer_cylinder: 0,
            xfer_head: 0,
            xfer_sector_ix: 0,
            wt_buffer: None,
            drive,
        }
    }

    /// Reset the controller. Reached via the chip-enable falling edge, an
    /// explicit system reset, or the high-to-low edge of the master-reset
    /// line; all transient state clears and the status layout reverts to
    /// Type I.
    pub fn reset(&mut self) {
        log::debug!("FDC reset");

        self.track = 0;
        self.sector = 0;
        self.data = 0;
        self.latch = 0;
        self.double_density = false;
        self.side_select = 0;

        self.fdc_enabled = false;
        self.busy = false;
        self.drq = false;
        self.drq_pace = DRQ_PACING_COUNT;
        self.crc_error = false;
        self.seek_error = false;
        self.head_loaded = false;
        self.record_type = false;
        self.record_not_found = false;
        self.lost_data = false;
        self.command_abort = false;
        self.index_reset = false;
        self.pending_interrupt = false;
        self.send_interrupt = false;

        self.command = Command::Restore;
        self.operation = Operation::None;
        self.xfer_buffer = None;
        self.xfer_index = 0;
        self.wt_buffer = None;

        self.drive.reset();
    }

    /// Master-reset pseudo-signal. The controller resets on the high-to-low
    /// edge.
    pub fn set_master_reset(&mut self, asserted: bool) {
        if self.master_reset && !asserted {
            self.reset();
        }
        self.master_reset = asserted;
    }

    #[inline]
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    #[inline]
    pub fn interrupt_pending(&self) -> bool {
        self.pending_interrupt
    }

    /// Family of the most recent command; selects the status bit layout.
    #[inline]
    pub fn last_command(&self) -> Command {
        self.command
    }

    pub fn drive(&self) -> &FloppyDiskDrive {
        &self.drive
    }

    pub fn drive_mut(&mut self) -> &mut FloppyDiskDrive {
        &mut self.drive
    }

    /// Drain the interrupt line. The enclosing emulator forwards the
    /// returned line to the CPU; command completion raises RST 7.5.
    pub fn take_interrupt(&mut self) -> Option<ExternalInterrupt> {
        if self.send_interrupt {
            self.send_interrupt = false;
            Some(ExternalInterrupt::Rst7_5)
        }
        else {
            None
        }
    }

    /// Terminal-count line from the DMA engine, folded into the external
    /// status byte.
    pub fn set_dma_tc(&mut self, tc: bool) {
        self.dma_tc = tc;
    }

    fn raise_interrupt(&mut self) {
        self.pending_interrupt = true;
        self.send_interrupt = true;
    }

    // ------------------------------------------------------------------
    // Port handlers
    // ------------------------------------------------------------------

    /// Compose the status byte for the family of the last command. Reading
    /// status deasserts the interrupt line.
    fn handle_status_register_read(&mut self) -> u8 {
        self.pending_interrupt = false;

        let mut status = 0;

        if !self.drive.is_selected() || !self.drive.is_loaded() {
            status |= STATUS_NOT_READY;
        }
        if self.busy {
            status |= STATUS_BUSY;
        }

        match self.command {
            Command::Restore
            | Command::Seek
            | Command::Step
            | Command::StepIn
            | Command::StepOut
            | Command::ForceInterrupt => {
                if self.drive.is_write_protected() {
                    status |= STATUS_WRITE_PROTECT;
                }
                if self.head_loaded {
                    status |= STATUS_HEAD_LOADED;
                }
                if self.seek_error {
                    status |= STATUS_SEEK_ERROR;
                }
                if self.crc_error {
                    status |= STATUS_CRC_ERROR;
                }
                if self.drive.track0() {
                    status |= STATUS_TRACK0;
                }
                if self.drive.index() || self.index_reset {
                    status |= STATUS_INDEX;
                }
            }
            Command::ReadSector | Command::ReadSectorMultiple | Command::ReadAddress => {
                if self.record_not_found {
                    status |= STATUS_RECORD_NOT_FOUND;
                }
                if self.crc_error {
                    status |= STATUS_CRC_ERROR;
                }
                if self.lost_data {
                    status |= STATUS_LOST_DATA;
                }
                if self.drq {
                    status |= STATUS_DRQ;
                }
            }
            Command::ReadTrack => {
                if self.lost_data {
                    status |= STATUS_LOST_DATA;
                }
                if self.drq {
                    status |= STATUS_DRQ;
                }
            }
            Command::WriteSector | Command::WriteSectorMultiple => {
                if self.drive.is_write_protected() {
                    status |= STATUS_WRITE_PROTECT;
                }
                if self.record_type {
                    status |= STATUS_RECORD_TYPE;
                }
                if self.record_not_found {
                    status |= STATUS_RECORD_NOT_FOUND;
                }
                if self.crc_error {
                    status |= STATUS_CRC_ERROR;
                }
                if self.lost_data {
                    status |= STATUS_LOST_DATA;
                }
                if self.drq {
                    status |= STATUS_DRQ;
                }
            }
            Command::WriteTrack => {
                if self.drive.is_write_protected() {
                    status |= STATUS_WRITE_PROTECT;
                }
                if self.record_type {
                    status |= STATUS_RECORD_TYPE;
                }
                if self.lost_data {
                    status |= STATUS_LOST_DATA;
                }
                if self.drq {
                    status |= STATUS_DRQ;
                }
            }
        }

        status
    }

    /// External status byte: drive and DMA lines the I/O processor can poll
    /// without touching the FDC proper. Reading consumes the disk-change
    /// latch.
    fn handle_external_status_read(&mut self) -> u8 {
        let mut status = 0;

        if self.dma_tc {
            status |= EXT_STATUS_DMA_TC;
        }
        if self.drive.is_two_sided() {
            status |= EXT_STATUS_TWO_SIDED;
        }
        if self.drive.disk_change() {
            status |= EXT_STATUS_DISK_CHANGE;
            self.drive.clear_disk_change();
        }
        if !self.drive.is_loaded() {
            status |= EXT_STATUS_NOT_LOADED;
        }

        status
    }

    /// External state latch write. Side effects apply in a fixed order:
    /// latch the flags, propagate drive select, recompute density and side,
    /// then act on the chip-enable bit.
    fn handle_external_state_write(&mut self, data: u8, scheduler: &mut EventScheduler) {
        let flags = StateLatch::from_bytes([data]);
        log::trace!(
            "External state write: {:02X} (dden:{} side:{} enable:{} drive:{})",
            data,
            flags.double_density(),
            flags.side_select(),
            flags.fdc_enable(),
            flags.drive_select()
        );

        self.latch = data;
        self.drive.select(flags.drive_select());
        self.double_density = flags.double_density();
        self.side_select = flags.side_select();

        if flags.fdc_enable() {
            self.enable_controller(scheduler);
        }
        else {
            self.disable_controller();
        }
    }

    /// Rising edge of chip enable. Dispatches a synthetic RESTORE and, with
    /// a drive selected, asserts the pseudo-index override for a short
    /// window. A diagnostic in the I/O processor ROM polls for an index
    /// pulse right after enabling the chip and hangs without it.
    fn enable_controller(&mut self, scheduler: &mut EventScheduler) {
        if self.fdc_enabled {
            return;
        }

        log::debug!("FDC enabled");
        self.fdc_enabled = true;

        // RESTORE with the head-load bit set.
        self.handle_command_register_write(0x08, scheduler)
            .expect("RESTORE dispatch cannot fail");

        if self.drive.is_selected() {
            self.index_reset = true;
            scheduler.schedule(
                INDEX_RESET_TIME_NS,
                DeviceContext::Fdc(FdcEvent {
                    seq: self.command_seq,
                    kind: FdcEventKind::IndexResetExpiry,
                }),
            );
        }
    }

    /// Falling edge of chip enable. Equivalent to a full reset.
    fn disable_controller(&mut self) {
        if !self.fdc_enabled {
            return;
        }
        log::debug!("FDC disabled");
        self.reset();
    }

    /// Decode and dispatch a command register write. A busy controller
    /// discards everything except ForceInterrupt.
    fn handle_command_register_write(
        &mut self,
        data: u8,
        scheduler: &mut EventScheduler,
    ) -> Result<(), DeviceError> {
        // Any command register write deasserts INTRQ.
        self.pending_interrupt = false;

        if !self.fdc_enabled {
            log::warn!("Command {:02X} written while FDC disabled", data);
            return Ok(());
        }

        let command = Command::decode(data);

        if self.busy && command != Command::ForceInterrupt {
            log::trace!("Command {:02X} rejected: controller busy", data);
            return Ok(());
        }

        if command == Command::ForceInterrupt {
            return self.command_force_interrupt(data);
        }

        // A new command clears the error status of the previous one and
        // starts a new scheduling generation.
        self.crc_error = false;
        self.seek_error = false;
        self.record_not_found = false;
        self.lost_data = false;
        self.record_type = false;
        self.command_abort = false;
        self.command_seq += 1;
        self.command = command;

        match command {
            Command::Restore | Command::Seek | Command::Step | Command::StepIn | Command::StepOut => {
                self.command_type_i(command, data, scheduler)
            }
            Command::ReadSector | Command::WriteSector => self.command_transfer(command, data, scheduler),
            Command::WriteTrack => self.command_write_track(data, scheduler),
            Command::ReadSectorMultiple
            | Command::WriteSectorMultiple
            | Command::ReadAddress
            | Command::ReadTrack => {
                // Recognized for status layout selection only.
                log::error!("Command {:02X} ({:?}) not implemented", data, command);
                Err(DeviceError::UnimplementedCommand(data))
            }
            Command::ForceInterrupt => unreachable!(),
        }
    }

    /// Type I dispatch: RESTORE, SEEK and the STEP variants share one
    /// scheduled worker.
    fn command_type_i(
        &mut self,
        kind: Command,
        data: u8,
        scheduler: &mut EventScheduler,
    ) -> Result<(), DeviceError> {
        let flags = TypeIFlags::from_bytes([data]);

        let target = match kind {
            // RESTORE seeks to zero from wherever the head really is; the
            // track register is synthetically loaded so the walk terminates
            // at the right place.
            Command::Restore => {
                self.track = self.drive.track() as u8;
                0
            }
            Command::Seek => self.data,
            _ => 0,
        };

        log::trace!(
            "{:?}: track:{} target:{} update:{} verify:{} head_load:{}",
            kind,
            self.track,
            target,
            flags.update(),
            flags.verify(),
            flags.head_load()
        );

        self.busy = true;
        self.operation = Operation::TypeI {
            kind,
            target,
            update: flags.update(),
            verify: flags.verify(),
            head_load: flags.head_load(),
        };

        scheduler.schedule(
            COMMAND_ACCEPT_TIME_NS,
            DeviceContext::Fdc(FdcEvent {
                seq: self.command_seq,
                kind: FdcEventKind::StepTick,
            }),
        );
        Ok(())
    }

    /// Type II dispatch: single-sector read or write.
    fn command_transfer(
        &mut self,
        kind: Command,
        data: u8,
        scheduler: &mut EventScheduler,
    ) -> Result<(), DeviceError> {
        let flags = TypeIIFlags::from_bytes([data]);
        self.side_select = flags.side();

        log::trace!(
            "{:?}: track:{} sector:{} side:{}",
            kind,
            self.track,
            self.sector,
            flags.side()
        );

        self.busy = true;
        self.operation = Operation::Transfer {
            write: kind == Command::WriteSector,
            side: flags.side(),
        };

        scheduler.schedule(
            COMMAND_ACCEPT_TIME_NS,
            DeviceContext::Fdc(FdcEvent {
                seq: self.command_seq,
                kind: FdcEventKind::TransferEntry,
            }),
        );
        Ok(())
    }

    /// Type III dispatch: WriteTrack. The track register, side select and
    /// density are captured here; the raw stream the host is about to
    /// deliver must agree with them.
    fn command_write_track(&mut self, data: u8, scheduler: &mut EventScheduler) -> Result<(), DeviceError> {
        let flags = TypeIIFlags::from_bytes([data]);
        self.side_select = flags.side();

        log::trace!(
            "WriteTrack: track:{} side:{} dden:{}",
            self.track,
            flags.side(),
            self.double_density
        );

        self.busy = true;
        self.operation = Operation::WriteTrack {
            side: flags.side(),
            double_density: self.double_density,
            track: self.track,
        };

        scheduler.schedule(
            COMMAND_ACCEPT_TIME_NS,
            DeviceContext::Fdc(FdcEvent {
                seq: self.command_seq,
                kind: FdcEventKind::WriteTrackEntry,
            }),
        );
        Ok(())
    }

    /// ForceInterrupt: abort whatever is in flight, synchronously. The
    /// interrupt-condition bits are observed but all conditions collapse to
    /// a plain abort. No interrupt is raised, and the status layout reverts
    /// to Type I.
    fn command_force_interrupt(&mut self, data: u8) -> Result<(), DeviceError> {
        log::trace!("ForceInterrupt: conditions {:01X}", data & 0x0F);

        self.command_abort = true;
        self.busy = false;
        self.drq = false;
        self.xfer_buffer = None;
        self.xfer_index = 0;
        self.wt_buffer = None;
        self.command = Command::Restore;
        Ok(())
    }

    /// Data register read. While a read transfer holds DRQ high this is the
    /// programmed-IO strobe: it returns the next sector byte and advances,
    /// finalizing the transfer at the end of the buffer.
    fn handle_data_register_read(&mut self) -> u8 {
        if self.drq {
            if let Operation::Transfer { write: false, .. } = self.operation {
                if let Some(buffer) = &self.xfer_buffer {
                    let byte = buffer[self.xfer_index];
                    self.data = byte;
                    self.xfer_index += 1;
                    self.drq_pace = DRQ_PACING_COUNT;
                    if self.xfer_index >= buffer.len() {
                        self.finish_data_transfer();
                    }
                    return byte;
                }
            }
        }
        self.data
    }

    /// Data register write. While DRQ is high this is the programmed-IO
    /// strobe for a sector write or the byte feed of a WriteTrack.
    fn handle_data_register_write(&mut self, data: u8) {
        self.data = data;

        if !self.drq {
            return;
        }

        match self.operation {
            Operation::Transfer { write: true, .. } => {
                if let Some(buffer) = &mut self.xfer_buffer {
                    buffer[self.xfer_index] = data;
                    self.xfer_index += 1;
                    self.drq_pace = DRQ_PACING_COUNT;
                    if self.xfer_index >= buffer.len() {
                        self.finish_data_transfer();
                    }
                }
            }
            Operation::WriteTrack { .. } => {
                if let Some(buffer) = &mut self.wt_buffer {
                    if buffer.len() < WRITE_TRACK_BUFFER_SIZE {
                        buffer.push(data);
                    }
                    else {
                        log::warn!("WriteTrack buffer overrun");
                        self.lost_data = true;
                    }
                }
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // DMA interface
    // ------------------------------------------------------------------

    /// Data-request line as seen by the DMA engine, paced by the countdown.
    pub fn drq(&mut self) -> bool {
        if !self.drq {
            return false;
        }
        self.drq_pace = self.drq_pace.saturating_sub(1);
        if self.drq_pace == 0 {
            self.drq_pace = DRQ_PACING_COUNT;
            true
        }
        else {
            false
        }
    }

    /// DMA byte fetch during a sector read.
    pub fn dma_read(&mut self) -> Result<u8, DeviceError> {
        let reading = matches!(self.operation, Operation::Transfer { write: false, .. });
        if !self.drq || !reading {
            log::error!("DMA read without an active read transfer");
            return Err(DeviceError::UnexpectedDma);
        }

        let buffer = self.xfer_buffer.as_ref().unwrap();
        if self.xfer_index >= buffer.len() {
            log::warn!("DMA read overran sector buffer ({} bytes)", buffer.len());
            return Ok(0);
        }

        let byte = buffer[self.xfer_index];
        self.data = byte;
        self.xfer_index += 1;
        self.drq_pace = DRQ_PACING_COUNT;
        Ok(byte)
    }

    /// DMA byte store during a sector write. Only WriteSector transfers by
    /// DMA; WriteTrack is timing-sensitive and must use programmed IO.
    pub fn dma_write(&mut self, data: u8) -> Result<(), DeviceError> {
        let writing = matches!(self.operation, Operation::Transfer { write: true, .. });
        if !self.drq || !writing {
            log::error!("DMA write without an active write transfer");
            return Err(DeviceError::UnexpectedDma);
        }

        let buffer = self.xfer_buffer.as_mut().unwrap();
        if self.xfer_index >= buffer.len() {
            log::warn!("DMA write overran sector buffer ({} bytes)", buffer.len());
            return Ok(());
        }

        buffer[self.xfer_index] = data;
        self.xfer_index += 1;
        self.drq_pace = DRQ_PACING_COUNT;
        Ok(())
    }

    /// End-of-transfer signal from the DMA engine.
    pub fn dma_complete(&mut self) {
        if matches!(self.operation, Operation::Transfer { .. }) {
            self.finish_data_transfer();
        }
        else {
            log::warn!("DMA complete without a transfer in flight");
        }
    }

    // ------------------------------------------------------------------
    // Scheduled event handlers
    // ------------------------------------------------------------------

    /// Dispatch a scheduled event back into the controller. Events from a
    /// superseded command generation, or arriving after ForceInterrupt, exit
    /// without touching state.
    pub fn handle_event(
        &mut self,
        event: FdcEvent,
        _timestamp_ns: u64,
        scheduler: &mut EventScheduler,
    ) -> Result<(), DeviceError> {
        if let FdcEventKind::IndexResetExpiry = event.kind {
            // Chip-scoped, not command-scoped; runs regardless of command
            // turnover.
            self.index_reset = false;
            return Ok(());
        }

        if event.seq != self.command_seq {
            log::trace!("Stale event {:?} ignored", event.kind);
            return Ok(());
        }
        if self.command_abort {
            log::trace!("Event {:?} cancelled by ForceInterrupt", event.kind);
            return Ok(());
        }

        match event.kind {
            FdcEventKind::StepTick => {
                self.handle_step_tick(scheduler);
                Ok(())
            }
            FdcEventKind::TransferEntry => {
                self.handle_transfer_entry();
                Ok(())
            }
            FdcEventKind::WriteTrackEntry => {
                self.handle_write_track_entry(scheduler);
                Ok(())
            }
            FdcEventKind::WriteTrackIndex => self.finish_write_track(),
            FdcEventKind::IndexResetExpiry => unreachable!(),
        }
    }

    /// One tick of the Type I worker: a single head step toward the target,
    /// or command completion.
    fn handle_step_tick(&mut self, scheduler: &mut EventScheduler) {
        let Operation::TypeI {
            kind,
            target,
            update,
            verify,
            head_load,
        } = self.operation
        else {
            return;
        };

        match kind {
            Command::Restore | Command::Seek => {
                if self.track == target {
                    self.complete_type_i(verify, head_load);
                    return;
                }
                let inward = target > self.track;
                self.track = if inward { self.track + 1 } else { self.track - 1 };
                self.step_inward = inward;
                self.drive.step(inward);

                scheduler.schedule(
                    STEP_TIME_NS,
                    DeviceContext::Fdc(FdcEvent {
                        seq: self.command_seq,
                        kind: FdcEventKind::StepTick,
                    }),
                );
            }
            Command::Step | Command::StepIn | Command::StepOut => {
                let inward = match kind {
                    Command::StepIn => true,
                    Command::StepOut => false,
                    _ => self.step_inward,
                };
                self.step_inward = inward;
                self.drive.step(inward);
                if update {
                    self.track = self.drive.track() as u8;
                }
                self.complete_type_i(verify, head_load);
            }
            _ => {}
        }
    }

    /// Type I completion: head load, optional verify, interrupt.
    fn complete_type_i(&mut self, verify: bool, head_load: bool) {
        self.head_loaded = head_load;

        if verify && self.drive.is_loaded() && self.track as u16 != self.drive.track() {
            log::trace!(
                "Verify failed: track register {} head at {}",
                self.track,
                self.drive.track()
            );
            self.seek_error = true;
        }

        self.busy = false;
        self.operation = Operation::None;
        self.raise_interrupt();
    }

    /// Sector transfer entry. Resolves the target, latches the failure
    /// flags, and either arms the buffer for DMA/PIO or abandons the command
    /// with the failure visible in status. The failure path raises no
    /// interrupt.
    fn handle_transfer_entry(&mut self) {
        let Operation::Transfer { write, side } = self.operation else {
            return;
        };

        let not_ready = !self.drive.is_selected() || !self.drive.is_loaded();
        let cylinder = self.drive.track();

        let (track_found, sector_count, track_format) = match self.drive.disk().and_then(|d| d.track(cylinder, side))
        {
            Some(track) => (true, track.sector_count(), track.format),
            None => (false, 0, TrackFormat::Unformatted),
        };

        self.record_not_found = self.track as u16 != cylinder
            || !track_found
            || self.sector == 0
            || self.sector > sector_count;

        self.crc_error = track_found
            && match track_format {
                TrackFormat::Fm500 => self.double_density,
                TrackFormat::Mfm500 => !self.double_density,
                TrackFormat::Unformatted => true,
            };

        let write_protect = write && self.drive.is_write_protected();

        if not_ready || self.record_not_found || self.crc_error || write_protect {
            log::trace!(
                "Transfer abandoned: not_ready:{} rnf:{} crc:{} wp:{}",
                not_ready,
                self.record_not_found,
                self.crc_error,
                write_protect
            );
            self.busy = false;
            self.drq = false;
            self.operation = Operation::None;
            return;
        }

        let sector_ix = self.sector - 1;
        self.xfer_cylinder = cylinder;
        self.xfer_head = side;
        self.xfer_sector_ix = sector_ix;
        self.xfer_index = 0;
        self.drq_pace = DRQ_PACING_COUNT;

        if write {
            let sector_len = self
                .drive
                .disk()
                .and_then(|d| d.sector(cylinder, side, sector_ix))
                .map_or(0, |s| s.len());
            self.xfer_buffer = Some(vec![0; sector_len]);
            if let Some(disk) = self.drive.disk_mut() {
                disk.set_modified();
            }
        }
        else {
            let data = self
                .drive
                .disk()
                .and_then(|d| d.sector(cylinder, side, sector_ix))
                .map(|s| s.data.clone())
                .unwrap_or_default();
            self.xfer_buffer = Some(data);
        }

        log::trace!(
            "{} sector c:{} h:{} s:{} ({} bytes)",
            if write { "Write" } else { "Read" },
            cylinder,
            side,
            self.sector,
            self.xfer_buffer.as_ref().map_or(0, |b| b.len())
        );

        self.drq = true;
    }

    /// Tear down a sector transfer: commit writes, drop the buffer, clear
    /// DRQ and busy, raise the completion interrupt.
    fn finish_data_transfer(&mut self) {
        let buffer = self.xfer_buffer.take();

        if let (Operation::Transfer { write: true, .. }, Some(buffer)) = (self.operation, buffer.as_ref()) {
            let (c, h, s) = (self.xfer_cylinder, self.xfer_head, self.xfer_sector_ix);
            if let Some(disk) = self.drive.disk_mut() {
                if let Some(sector) = disk.sector_mut(c, h, s) {
                    sector.data.copy_from_slice(buffer);
                }
                disk.set_modified();
            }
        }

        log::trace!("Transfer complete ({} bytes)", self.xfer_index);

        self.xfer_index = 0;
        self.drq = false;
        self.busy = false;
        self.operation = Operation::None;
        self.raise_interrupt();
    }

    /// WriteTrack entry: same readiness gate as the sector engine, then a
    /// scratch buffer is armed and the terminating index edge scheduled one
    /// revolution out.
    fn handle_write_track_entry(&mut self, scheduler: &mut EventScheduler) {
        let Operation::WriteTrack { .. } = self.operation else {
            return;
        };

        let not_ready = !self.drive.is_selected() || !self.drive.is_loaded();
        let write_protect = self.drive.is_write_protected();

        if not_ready || write_protect {
            log::trace!("WriteTrack abandoned: not_ready:{} wp:{}", not_ready, write_protect);
            self.busy = false;
            self.drq = false;
            self.operation = Operation::None;
            return;
        }

        self.wt_buffer = Some(Vec::with_capacity(WRITE_TRACK_BUFFER_SIZE));
        self.drq = true;
        self.drq_pace = DRQ_PACING_COUNT;

        scheduler.schedule(
            ROTATION_TIME_NS,
            DeviceContext::Fdc(FdcEvent {
                seq: self.command_seq,
                kind: FdcEventKind::WriteTrackIndex,
            }),
        );
    }

    /// The index edge ending a WriteTrack: parse the accumulated stream and
    /// format the track. A malformed stream is a host programming error and
    /// halts the session; the media is left untouched in that case.
    fn finish_write_track(&mut self) -> Result<(), DeviceError> {
        let Operation::WriteTrack {
            side,
            double_density,
            track,
        } = self.operation
        else {
            return Ok(());
        };

        let stream = self.wt_buffer.take().unwrap_or_default();
        self.drq = false;

        let layout = parse_track_stream(&stream, double_density, track, side)?;

        let format = if double_density {
            TrackFormat::Mfm500
        }
        else {
            TrackFormat::Fm500
        };

        log::debug!(
            "WriteTrack: formatting c:{} h:{} {} sectors of {} bytes ({})",
            track,
            side,
            layout.sector_count,
            layout.sector_size,
            format
        );

        if let Some(disk) = self.drive.disk_mut() {
            disk.format_track(format, track as u16, side, layout.sector_count, layout.sector_size);
        }

        self.busy = false;
        self.operation = Operation::None;
        self.raise_interrupt();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_types::disk::{DiskGeometry, FloppyDisk, TrackFormat};

    const LATCH_DDEN: u8 = 0b0000_0100;
    const LATCH_ENABLE: u8 = 0b0001_0000;
    const LATCH_DRIVE: u8 = 0b0010_0000;

    const MFM_GEOMETRY: DiskGeometry = DiskGeometry {
        format: TrackFormat::Mfm500,
        cylinders: 77,
        heads: 1,
        sectors: 26,
        sector_size: 256,
    };

    /// Wires a controller to the scheduler and pumps due events the way the
    /// emulator's run loop does.
    struct TestBed {
        fdc: FloppyController,
        scheduler: EventScheduler,
    }

    impl TestBed {
        fn new() -> Self {
            Self {
                fdc: FloppyController::new(FloppyDiskDrive::default()),
                scheduler: EventScheduler::new(),
            }
        }

        fn with_disk(disk: FloppyDisk, write_protect: bool) -> Self {
            let mut bed = Self::new();
            bed.fdc.drive_mut().load_disk(disk, write_protect);
            bed
        }

        fn with_mfm_disk() -> Self {
            Self::with_disk(FloppyDisk::formatted(MFM_GEOMETRY), false)
        }

        fn write(&mut self, port: u16, data: u8) {
            self.fdc.write_u8(port, data, &mut self.scheduler).unwrap();
        }

        fn read(&mut self, port: u16) -> u8 {
            self.fdc.read_u8(port).unwrap()
        }

        /// Enable the chip (with a drive selected) and let the synthetic
        /// RESTORE and index override play out, servicing the completion
        /// interrupt.
        fn enable(&mut self, latch_extra: u8) {
            self.write(EXTERNAL_STATE_PORT, LATCH_ENABLE | LATCH_DRIVE | latch_extra);
            self.settle().unwrap();
            self.fdc.take_interrupt();
        }

        fn drain(&mut self) -> Result<(), DeviceError> {
            while let Some((timestamp, DeviceContext::Fdc(event))) = self.scheduler.pop_due() {
                self.fdc.handle_event(event, timestamp, &mut self.scheduler)?;
            }
            Ok(())
        }

        /// Advance the clock and dispatch everything that comes due.
        fn run(&mut self, delta_ns: u64) -> Result<(), DeviceError> {
            self.scheduler.advance(delta_ns);
            self.drain()
        }

        /// Run the scheduler dry.
        fn settle(&mut self) -> Result<(), DeviceError> {
            while let Some(due) = self.scheduler.next_due_ns() {
                let now = self.scheduler.now_ns();
                if due > now {
                    self.scheduler.advance(due - now);
                }
                self.drain()?;
            }
            Ok(())
        }

        fn seek(&mut self, cylinder: u8) {
            self.write(FDC_DATA_REGISTER, cylinder);
            self.write(FDC_COMMAND_REGISTER, 0x10);
            self.settle().unwrap();
            self.fdc.take_interrupt();
        }

        /// Feed one formatted sector's worth of WriteTrack stream bytes
        /// through the data port.
        fn feed_format_sector(&mut self, track: u8, sector: u8, length_code: u8) {
            for byte in [ID_RECORD_MARK, track, 0, sector, length_code] {
                self.write(FDC_DATA_REGISTER, byte);
            }
            self.write(FDC_DATA_REGISTER, DATA_RECORD_MARK);
            for _ in 0..(128usize << length_code) {
                self.write(FDC_DATA_REGISTER, 0x00);
            }
            self.write(FDC_DATA_REGISTER, RECORD_END_MARK);
        }
    }

    use super::write_track::{DATA_RECORD_MARK, GAP_BYTE_MFM, ID_RECORD_MARK, INDEX_MARK, RECORD_END_MARK};

    #[test]
    fn chip_enable_restores_to_track_zero() {
        let mut bed = TestBed::with_mfm_disk();
        bed.fdc.drive_mut().seek_to(5);
        bed.write(FDC_TRACK_REGISTER, 99);

        bed.write(EXTERNAL_STATE_PORT, LATCH_ENABLE | LATCH_DRIVE | LATCH_DDEN);
        assert!(bed.fdc.is_busy());

        bed.settle().unwrap();

        assert_eq!(bed.read(FDC_TRACK_REGISTER), 0);
        assert_eq!(bed.fdc.drive().track(), 0);
        assert!(bed.fdc.interrupt_pending());
        assert_eq!(bed.fdc.take_interrupt(), Some(ExternalInterrupt::Rst7_5));

        let status = bed.read(FDC_STATUS_REGISTER);
        assert_ne!(status & STATUS_TRACK0, 0);
        assert_eq!(status & STATUS_BUSY, 0);
        assert_ne!(status & STATUS_HEAD_LOADED, 0);

        // The status read deasserted INTRQ.
        assert!(!bed.fdc.interrupt_pending());
    }

    #[test]
    fn index_override_follows_chip_enable() {
        let mut bed = TestBed::with_mfm_disk();
        bed.write(EXTERNAL_STATE_PORT, LATCH_ENABLE | LATCH_DRIVE | LATCH_DDEN);

        // Walk the drive's index counter out of its pulse window so only
        // the override can assert the bit.
        for _ in 0..7 {
            bed.fdc.drive_mut().index();
        }
        let status = bed.read(FDC_STATUS_REGISTER);
        assert_ne!(status & STATUS_INDEX, 0);

        // After the override expires the bit tracks the real sensor.
        bed.settle().unwrap();
        let status = bed.read(FDC_STATUS_REGISTER);
        assert_eq!(status & STATUS_INDEX, 0);
    }

    #[test]
    fn seek_with_verify_reports_desynced_head() {
        let mut bed = TestBed::with_mfm_disk();
        bed.enable(LATCH_DDEN);

        // Desync the physical head from the track register.
        bed.fdc.drive_mut().seek_to(3);

        bed.write(FDC_DATA_REGISTER, 5);
        bed.write(FDC_COMMAND_REGISTER, 0x14); // SEEK, verify
        bed.settle().unwrap();

        assert_eq!(bed.read(FDC_TRACK_REGISTER), 5);
        assert_eq!(bed.fdc.drive().track(), 8);

        let status = bed.read(FDC_STATUS_REGISTER);
        assert_ne!(status & STATUS_SEEK_ERROR, 0);
    }

    #[test]
    fn step_commands_move_one_cylinder() {
        let mut bed = TestBed::with_mfm_disk();
        bed.enable(LATCH_DDEN);

        // STEP-IN with update: register follows the head.
        bed.write(FDC_COMMAND_REGISTER, 0x50);
        bed.settle().unwrap();
        assert_eq!(bed.fdc.drive().track(), 1);
        assert_eq!(bed.read(FDC_TRACK_REGISTER), 1);

        // STEP repeats the last direction; without update the register
        // stays put.
        bed.write(FDC_COMMAND_REGISTER, 0x20);
        bed.settle().unwrap();
        assert_eq!(bed.fdc.drive().track(), 2);
        assert_eq!(bed.read(FDC_TRACK_REGISTER), 1);

        // STEP-OUT with update.
        bed.write(FDC_COMMAND_REGISTER, 0x70);
        bed.settle().unwrap();
        assert_eq!(bed.fdc.drive().track(), 1);
        assert_eq!(bed.read(FDC_TRACK_REGISTER), 1);
    }

    #[test]
    fn sector_read_via_dma() {
        let mut bed = TestBed::with_mfm_disk();
        let sector = bed
            .fdc
            .drive_mut()
            .disk_mut()
            .unwrap()
            .sector_mut(2, 0, 2)
            .unwrap();
        sector.data = (0..=255).collect();

        bed.enable(LATCH_DDEN);
        bed.seek(2);

        bed.write(FDC_SECTOR_REGISTER, 3);
        bed.write(FDC_COMMAND_REGISTER, 0x80);
        bed.settle().unwrap();
        assert!(bed.fdc.is_busy());

        for i in 0..256u32 {
            // The DMA engine polls DRQ many times per byte; the pacing
            // countdown answers within one count window.
            let mut polls = 0;
            while !bed.fdc.drq() {
                polls += 1;
                assert!(polls <= DRQ_PACING_COUNT as u32);
            }
            assert_eq!(bed.fdc.dma_read().unwrap(), i as u8);
        }

        // Overrun reads log and return filler until the DMA engine signals
        // completion.
        assert_eq!(bed.fdc.dma_read().unwrap(), 0);

        bed.fdc.dma_complete();
        assert!(!bed.fdc.is_busy());
        assert_eq!(bed.read(FDC_STATUS_REGISTER) & STATUS_DRQ, 0);
        assert_eq!(bed.fdc.take_interrupt(), Some(ExternalInterrupt::Rst7_5));
    }

    #[test]
    fn sector_read_via_pio() {
        let mut bed = TestBed::with_mfm_disk();
        bed.enable(LATCH_DDEN);

        bed.write(FDC_SECTOR_REGISTER, 1);
        bed.write(FDC_COMMAND_REGISTER, 0x80);
        bed.settle().unwrap();

        // Reads of the data port drain the buffer and self-finalize.
        let mut count = 0;
        while bed.read(FDC_STATUS_REGISTER) & STATUS_DRQ != 0 {
            bed.read(FDC_DATA_REGISTER);
            count += 1;
        }
        assert_eq!(count, MFM_GEOMETRY.sector_size);
        assert!(!bed.fdc.is_busy());
        assert_eq!(bed.fdc.take_interrupt(), Some(ExternalInterrupt::Rst7_5));
    }

    #[test]
    fn sector_write_commits_on_completion_and_is_idempotent() {
        let mut bed = TestBed::with_mfm_disk();
        bed.enable(LATCH_DDEN);

        let pattern: Vec<u8> = (0..256u32).map(|i| (i * 3) as u8).collect();

        for _ in 0..2 {
            bed.write(FDC_SECTOR_REGISTER, 4);
            bed.write(FDC_COMMAND_REGISTER, 0xA0);
            bed.settle().unwrap();
            assert!(bed.fdc.is_busy());

            for &byte in &pattern {
                bed.fdc.dma_write(byte).unwrap();
            }
            bed.fdc.dma_complete();

            assert!(!bed.fdc.is_busy());
            assert_eq!(bed.fdc.take_interrupt(), Some(ExternalInterrupt::Rst7_5));

            let disk = bed.fdc.drive().disk().unwrap();
            assert_eq!(disk.sector(0, 0, 3).unwrap().data, pattern);
            assert!(disk.is_modified());
        }
    }

    #[test]
    fn write_to_protected_disk_is_abandoned() {
        let mut bed = TestBed::with_disk(FloppyDisk::formatted(MFM_GEOMETRY), true);
        bed.enable(LATCH_DDEN);

        bed.write(FDC_SECTOR_REGISTER, 1);
        bed.write(FDC_COMMAND_REGISTER, 0xA0);
        bed.settle().unwrap();

        assert!(!bed.fdc.is_busy());
        assert!(bed.fdc.take_interrupt().is_none());

        let status = bed.read(FDC_STATUS_REGISTER);
        assert_ne!(status & STATUS_WRITE_PROTECT, 0);
        assert_eq!(status & STATUS_DRQ, 0);
    }

    #[test]
    fn density_mismatch_sets_crc_error() {
        // MFM media, but the latch claims single density.
        let mut bed = TestBed::with_mfm_disk();
        bed.enable(0);

        bed.write(FDC_SECTOR_REGISTER, 1);
        bed.write(FDC_COMMAND_REGISTER, 0x80);
        bed.settle().unwrap();

        assert!(!bed.fdc.is_busy());
        assert!(bed.fdc.take_interrupt().is_none());

        let status = bed.read(FDC_STATUS_REGISTER);
        assert_ne!(status & STATUS_CRC_ERROR, 0);
        assert_eq!(status & STATUS_DRQ, 0);
    }

    #[test]
    fn missing_records_set_rnf() {
        let mut bed = TestBed::with_mfm_disk();
        bed.enable(LATCH_DDEN);

        // Sector beyond the track's sector count.
        bed.write(FDC_SECTOR_REGISTER, 27);
        bed.write(FDC_COMMAND_REGISTER, 0x80);
        bed.settle().unwrap();
        assert_ne!(bed.read(FDC_STATUS_REGISTER) & STATUS_RECORD_NOT_FOUND, 0);

        // Track register desynced from the physical head.
        bed.write(FDC_TRACK_REGISTER, 9);
        bed.write(FDC_SECTOR_REGISTER, 1);
        bed.write(FDC_COMMAND_REGISTER, 0x80);
        bed.settle().unwrap();
        assert_ne!(bed.read(FDC_STATUS_REGISTER) & STATUS_RECORD_NOT_FOUND, 0);
    }

    #[test]
    fn write_track_formats_the_track() {
        let mut bed = TestBed::with_disk(FloppyDisk::blank(77, 1), false);
        bed.enable(LATCH_DDEN);
        bed.seek(7);

        bed.write(FDC_COMMAND_REGISTER, 0xF0);
        bed.run(COMMAND_ACCEPT_TIME_NS).unwrap();
        assert_ne!(bed.read(FDC_STATUS_REGISTER) & STATUS_DRQ, 0);

        bed.write(FDC_DATA_REGISTER, GAP_BYTE_MFM);
        bed.write(FDC_DATA_REGISTER, INDEX_MARK);
        for sector in 1..=9 {
            bed.feed_format_sector(7, sector, 2);
        }

        // The index hole comes around and ends the command.
        bed.settle().unwrap();

        assert!(!bed.fdc.is_busy());
        assert_eq!(bed.read(FDC_STATUS_REGISTER) & STATUS_DRQ, 0);
        assert_eq!(bed.fdc.take_interrupt(), Some(ExternalInterrupt::Rst7_5));

        let track = bed.fdc.drive().disk().unwrap().track(7, 0).unwrap();
        assert_eq!(track.format, TrackFormat::Mfm500);
        assert_eq!(track.sector_count(), 9);
        assert_eq!(track.sector_size(), 512);

        // Round trip: a freshly formatted sector reads back at its full
        // declared size.
        bed.write(FDC_SECTOR_REGISTER, 9);
        bed.write(FDC_COMMAND_REGISTER, 0x80);
        bed.settle().unwrap();

        let mut count = 0;
        while bed.read(FDC_STATUS_REGISTER) & STATUS_DRQ != 0 {
            bed.read(FDC_DATA_REGISTER);
            count += 1;
        }
        assert_eq!(count, 512);
    }

    #[test]
    fn side_select_bit_targets_the_second_head() {
        // Only head 1 is formatted; the command's side bit picks it.
        let mut disk = FloppyDisk::blank(77, 2);
        disk.format_track(TrackFormat::Mfm500, 0, 1, 26, 256);
        let mut bed = TestBed::with_disk(disk, false);
        bed.enable(LATCH_DDEN);

        bed.write(FDC_SECTOR_REGISTER, 1);
        bed.write(FDC_COMMAND_REGISTER, 0x82);
        bed.settle().unwrap();

        let mut count = 0;
        while bed.read(FDC_STATUS_REGISTER) & STATUS_DRQ != 0 {
            bed.read(FDC_DATA_REGISTER);
            count += 1;
        }
        assert_eq!(count, 256);

        // The unformatted side fails the same request.
        bed.write(FDC_COMMAND_REGISTER, 0x80);
        bed.settle().unwrap();
        assert!(!bed.fdc.is_busy());
        assert_ne!(bed.read(FDC_STATUS_REGISTER) & STATUS_CRC_ERROR, 0);
    }

    #[test]
    fn write_track_on_protected_disk_is_abandoned() {
        let mut bed = TestBed::with_disk(FloppyDisk::blank(77, 1), true);
        bed.enable(LATCH_DDEN);

        bed.write(FDC_COMMAND_REGISTER, 0xF0);
        bed.settle().unwrap();

        assert!(!bed.fdc.is_busy());
        assert!(bed.fdc.take_interrupt().is_none());

        let status = bed.read(FDC_STATUS_REGISTER);
        assert_ne!(status & STATUS_WRITE_PROTECT, 0);
        assert_eq!(status & STATUS_DRQ, 0);
    }

    #[test]
    fn write_track_with_inconsistent_sector_size_is_fatal() {
        let mut bed = TestBed::with_disk(FloppyDisk::blank(77, 1), false);
        bed.enable(LATCH_DDEN);
        bed.seek(7);

        bed.write(FDC_COMMAND_REGISTER, 0xF0);
        bed.run(COMMAND_ACCEPT_TIME_NS).unwrap();

        bed.write(FDC_DATA_REGISTER, GAP_BYTE_MFM);
        bed.write(FDC_DATA_REGISTER, INDEX_MARK);
        for sector in 1..=9 {
            // Sector 5 declares 1024-byte sectors on a 512-byte track.
            bed.feed_format_sector(7, sector, if sector == 5 { 3 } else { 2 });
        }

        let err = bed.settle().unwrap_err();
        assert!(matches!(err, DeviceError::InvariantViolation(_)));
        assert!(!bed.fdc.drive().disk().unwrap().is_modified());
    }

    #[test]
    fn force_interrupt_aborts_a_seek_in_flight() {
        let mut bed = TestBed::with_mfm_disk();
        bed.enable(LATCH_DDEN);

        bed.write(FDC_DATA_REGISTER, 50);
        bed.write(FDC_COMMAND_REGISTER, 0x10);

        // First step fires at the accept latency, each further step one
        // step time later: ten steps in total.
        bed.run(COMMAND_ACCEPT_TIME_NS).unwrap();
        for _ in 0..9 {
            bed.run(STEP_TIME_NS).unwrap();
        }
        assert_eq!(bed.read(FDC_TRACK_REGISTER), 10);
        assert!(bed.fdc.is_busy());

        bed.write(FDC_COMMAND_REGISTER, 0xD0);
        assert!(!bed.fdc.is_busy());

        // The pending step tick observes the abort and exits without moving
        // the head or raising an interrupt.
        bed.settle().unwrap();
        assert_eq!(bed.read(FDC_TRACK_REGISTER), 10);
        assert_eq!(bed.fdc.drive().track(), 10);
        assert!(bed.fdc.take_interrupt().is_none());
        assert!(!bed.fdc.interrupt_pending());

        // Status layout reverts to Type I.
        assert_eq!(bed.fdc.last_command(), Command::Restore);
    }

    #[test]
    fn a_new_command_invalidates_stale_events() {
        let mut bed = TestBed::with_mfm_disk();
        bed.enable(LATCH_DDEN);

        bed.write(FDC_DATA_REGISTER, 50);
        bed.write(FDC_COMMAND_REGISTER, 0x10);
        bed.run(COMMAND_ACCEPT_TIME_NS).unwrap();
        bed.write(FDC_COMMAND_REGISTER, 0xD0);

        // RESTORE right away; the aborted seek's pending tick must not
        // disturb it.
        bed.write(FDC_COMMAND_REGISTER, 0x08);
        bed.settle().unwrap();

        assert_eq!(bed.read(FDC_TRACK_REGISTER), 0);
        assert_eq!(bed.fdc.drive().track(), 0);
        assert!(bed.fdc.interrupt_pending());
    }

    #[test]
    fn busy_controller_rejects_commands() {
        let mut bed = TestBed::with_mfm_disk();
        bed.enable(LATCH_DDEN);

        bed.write(FDC_DATA_REGISTER, 5);
        bed.write(FDC_COMMAND_REGISTER, 0x10);
        assert!(bed.fdc.is_busy());

        // A second command while busy is discarded.
        bed.write(FDC_COMMAND_REGISTER, 0x70);
        bed.settle().unwrap();

        assert_eq!(bed.read(FDC_TRACK_REGISTER), 5);
        assert_eq!(bed.fdc.drive().track(), 5);
    }

    #[test]
    fn unimplemented_commands_error_but_select_status_layout() {
        let mut bed = TestBed::with_mfm_disk();
        bed.enable(LATCH_DDEN);

        // Type I layout shows track 0 in bit 2.
        assert_ne!(bed.read(FDC_STATUS_REGISTER) & STATUS_TRACK0, 0);

        let err = bed
            .fdc
            .write_u8(FDC_COMMAND_REGISTER, 0xC0, &mut bed.scheduler)
            .unwrap_err();
        assert!(matches!(err, DeviceError::UnimplementedCommand(0xC0)));

        // Same bit now reads as lost-data in the ReadAddress layout.
        assert_eq!(bed.read(FDC_STATUS_REGISTER) & STATUS_LOST_DATA, 0);
        assert!(!bed.fdc.is_busy());

        for opcode in [0x90, 0xB0, 0xE0] {
            let err = bed
                .fdc
                .write_u8(FDC_COMMAND_REGISTER, opcode, &mut bed.scheduler)
                .unwrap_err();
            assert!(matches!(err, DeviceError::UnimplementedCommand(_)));
        }
    }

    #[test]
    fn dma_transactions_must_match_the_command() {
        let mut bed = TestBed::with_mfm_disk();
        bed.enable(LATCH_DDEN);

        // No transfer in flight at all.
        assert!(matches!(bed.fdc.dma_read(), Err(DeviceError::UnexpectedDma)));
        assert!(matches!(bed.fdc.dma_write(0), Err(DeviceError::UnexpectedDma)));

        // DMA writes during a read command are a host programming error.
        bed.write(FDC_SECTOR_REGISTER, 1);
        bed.write(FDC_COMMAND_REGISTER, 0x80);
        bed.settle().unwrap();
        assert!(matches!(bed.fdc.dma_write(0), Err(DeviceError::UnexpectedDma)));
    }

    #[test]
    fn unclaimed_ports_are_rejected() {
        let mut bed = TestBed::new();
        assert!(matches!(bed.fdc.read_u8(0x80), Err(DeviceError::UnexpectedPort(0x80))));
        assert!(matches!(
            bed.fdc.write_u8(0x42, 0, &mut bed.scheduler),
            Err(DeviceError::UnexpectedPort(0x42))
        ));
    }

    #[test]
    fn external_status_reflects_drive_and_dma_lines() {
        let mut bed = TestBed::new();
        let status = bed.read(EXTERNAL_STATE_PORT);
        assert_ne!(status & EXT_STATUS_NOT_LOADED, 0);
        assert_eq!(status & EXT_STATUS_TWO_SIDED, 0);

        bed.fdc.drive_mut().load_disk(FloppyDisk::blank(77, 2), false);
        let status = bed.read(EXTERNAL_STATE_PORT);
        assert_eq!(status & EXT_STATUS_NOT_LOADED, 0);
        assert_ne!(status & EXT_STATUS_TWO_SIDED, 0);
        assert_ne!(status & EXT_STATUS_DISK_CHANGE, 0);

        // The disk-change latch is consumed by the read.
        let status = bed.read(EXTERNAL_STATE_PORT);
        assert_eq!(status & EXT_STATUS_DISK_CHANGE, 0);

        bed.fdc.set_dma_tc(true);
        assert_ne!(bed.read(EXTERNAL_STATE_PORT) & EXT_STATUS_DMA_TC, 0);
    }

    #[test]
    fn dropping_chip_enable_resets_the_controller() {
        let mut bed = TestBed::with_mfm_disk();
        bed.enable(LATCH_DDEN);

        bed.write(FDC_SECTOR_REGISTER, 7);
        bed.write(FDC_DATA_REGISTER, 20);
        bed.write(FDC_COMMAND_REGISTER, 0x10);
        assert!(bed.fdc.is_busy());

        bed.write(EXTERNAL_STATE_PORT, 0);

        assert!(!bed.fdc.is_busy());
        assert_eq!(bed.read(FDC_TRACK_REGISTER), 0);
        assert_eq!(bed.read(FDC_SECTOR_REGISTER), 0);
        assert_eq!(bed.fdc.last_command(), Command::Restore);

        // Commands are ignored until the chip is enabled again.
        bed.write(FDC_COMMAND_REGISTER, 0x10);
        assert!(!bed.fdc.is_busy());
        bed.settle().unwrap();
    }

    #[test]
    fn master_reset_falling_edge_resets() {
        let mut bed = TestBed::with_mfm_disk();
        bed.enable(LATCH_DDEN);
        bed.write(FDC_TRACK_REGISTER, 12);

        bed.fdc.set_master_reset(true);
        assert_eq!(bed.read(FDC_TRACK_REGISTER), 12);

        bed.fdc.set_master_reset(false);
        assert_eq!(bed.read(FDC_TRACK_REGISTER), 0);
        assert_eq!(bed.fdc.last_command(), Command::Restore);
    }

    #[test]
    fn port_claims_cover_both_latches() {
        let bed = TestBed::new();
        let reads: Vec<u16> = bed.fdc.read_ports().iter().map(|(_, p)| *p).collect();
        let writes: Vec<u16> = bed.fdc.write_ports().iter().map(|(_, p)| *p).collect();

        assert_eq!(reads, vec![0x84, 0x85, 0x86, 0x87, 0xE8]);
        assert_eq!(writes, vec![0x84, 0x85, 0x86, 0x87, 0xE8]);
    }
}
