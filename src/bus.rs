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

    bus.rs

    IO port device trait and the device error taxonomy.

    Devices claim their ports per side; the enclosing emulator routes port
    accesses by those claims. Unclaimed accesses and host programming errors
    that would corrupt emulated media are fatal and halt the session via
    DeviceError rather than being silently absorbed.
*/

#![allow(dead_code)]

use std::{error::Error, fmt::Display};

use crate::scheduler::EventScheduler;

/// The byte returned from an unconnected IO address.
pub const NO_IO_BYTE: u8 = 0xFF;

#[derive(Debug)]
pub enum DeviceError {
    /// A port access was routed to a device that does not claim the port on
    /// that side.
    UnexpectedPort(u16),
    /// A DMA transaction arrived that the current controller state cannot
    /// accept (DRQ low, or DMA during a non-DMA command).
    UnexpectedDma,
    /// Host programming produced a state the hardware contract forbids, such
    /// as a malformed WriteTrack byte stream.
    InvariantViolation(String),
    /// The command opcode is recognized but its execution is not emulated.
    UnimplementedCommand(u8),
}

impl Error for DeviceError {}
impl Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::UnexpectedPort(port) => {
                write!(f, "Access to unexpected port {:02X}h.", port)
            }
            DeviceError::UnexpectedDma => {
                write!(f, "DMA transaction without a matching data request.")
            }
            DeviceError::InvariantViolation(msg) => {
                write!(f, "Device invariant violated: {}", msg)
            }
            DeviceError::UnimplementedCommand(opcode) => {
                write!(f, "Command {:02X}h recognized but not implemented.", opcode)
            }
        }
    }
}

/// Port-level interface implemented by IO devices.
///
/// A device advertises the ports it claims on each side; the emulator's port
/// dispatch consults the claim lists when installing the device. Writes may
/// need to schedule future work, so the scheduler is passed in.
pub trait IoDevice {
    fn read_u8(&mut self, port: u16) -> Result<u8, DeviceError>;
    fn write_u8(&mut self, port: u16, data: u8, scheduler: &mut EventScheduler) -> Result<(), DeviceError>;
    fn read_ports(&self) -> Vec<(String, u16)>;
    fn write_ports(&self) -> Vec<(String, u16)>;
}
