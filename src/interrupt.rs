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

    interrupt.rs

    External interrupt lines of the 8085 I/O processor.
*/

#![allow(dead_code)]

use std::fmt::Display;

/// The dedicated external interrupt inputs of the 8085, in priority order.
/// The floppy controller raises RST 7.5 on command completion; devices hold
/// the line identifier rather than a vector since the 8085 inputs are
/// hardwired to fixed restart addresses.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExternalInterrupt {
    Trap,
    Rst7_5,
    Rst6_5,
    Rst5_5,
    Intr,
}

impl Display for ExternalInterrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExternalInterrupt::Trap => write!(f, "TRAP"),
            ExternalInterrupt::Rst7_5 => write!(f, "RST7.5"),
            ExternalInterrupt::Rst6_5 => write!(f, "RST6.5"),
            ExternalInterrupt::Rst5_5 => write!(f, "RST5.5"),
            ExternalInterrupt::Intr => write!(f, "INTR"),
        }
    }
}
