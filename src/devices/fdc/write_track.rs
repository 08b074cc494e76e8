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

    devices::fdc::write_track.rs

    Parser for the raw byte stream a host deposits during a WriteTrack
    command.

    The stream is the literal formatting data the FD1797 would clock onto
    the media: gap filler, an index mark, then per sector an ID record
    (track, head, sector, length code) and a data record bracketed by the
    data mark and the CRC placeholder. The parser reconstructs the sector
    layout so the track can be formatted on the backing disk. Malformed
    streams are host programming errors and fatal.
*/

use crate::bus::DeviceError;

/// Scratch buffer capacity for an in-flight WriteTrack. Comfortably above
/// the byte count of one raw MFM track at 500 kbit/s.
pub const WRITE_TRACK_BUFFER_SIZE: usize = 65_536;

pub const GAP_BYTE_MFM: u8 = 0x4E;
pub const GAP_BYTE_FM: u8 = 0xFF;
pub const INDEX_MARK: u8 = 0xFC;
pub const ID_RECORD_MARK: u8 = 0xFE;
pub const DATA_RECORD_MARK: u8 = 0xFB;
pub const RECORD_END_MARK: u8 = 0xF7;

/// Sector layout recovered from a WriteTrack stream. Sector IDs are
/// guaranteed to be the contiguous run 1..=sector_count, all declaring
/// sector_size bytes.
#[derive(Copy, Clone, Debug)]
pub struct TrackLayout {
    pub sector_count: u8,
    pub sector_size: usize,
}

#[derive(Copy, Clone, Debug)]
enum ParseState {
    Gap4,
    IndexMark,
    IdRecordMark,
    DataRecordMark,
}

fn stream_err(msg: String) -> DeviceError {
    log::error!("WriteTrack stream: {}", msg);
    DeviceError::InvariantViolation(msg)
}

fn decode_sector_size(code: u8) -> Option<usize> {
    match code {
        0x00 => Some(128),
        0x01 => Some(256),
        0x02 => Some(512),
        0x03 => Some(1024),
        _ => None,
    }
}

/// Parse a complete WriteTrack byte stream.
///
/// `double_density` is the -DDEN state captured from the external latch when
/// the command was accepted; `fdc_track` and `side` are the track register
/// and side select captured at the same moment. The ID records in the
/// stream must agree with all three.
pub fn parse_track_stream(
    stream: &[u8],
    double_density: bool,
    fdc_track: u8,
    side: u8,
) -> Result<TrackLayout, DeviceError> {
    let mut state = ParseState::Gap4;
    let mut pos = 0;

    let mut sector_ids: Vec<u8> = Vec::new();
    let mut sector_size: usize = 0;

    while pos < stream.len() {
        match state {
            ParseState::Gap4 => {
                // The first gap byte tells us the density the host believes
                // it is formatting at; it must match the latch.
                let expected = if double_density { GAP_BYTE_MFM } else { GAP_BYTE_FM };
                let byte = stream[pos];
                if byte != expected {
                    return Err(stream_err(format!(
                        "gap byte {:02X}h does not match density (expected {:02X}h)",
                        byte, expected
                    )));
                }
                pos += 1;
                state = ParseState::IndexMark;
            }
            ParseState::IndexMark => {
                // Filler until the soft index mark.
                if stream[pos] == INDEX_MARK {
                    state = ParseState::IdRecordMark;
                }
                pos += 1;
            }
            ParseState::IdRecordMark => {
                if stream[pos] == ID_RECORD_MARK {
                    pos += 1;
                    if pos + 4 > stream.len() {
                        return Err(stream_err("truncated sector ID record".to_string()));
                    }
                    let id_track = stream[pos];
                    let id_head = stream[pos + 1];
                    let id_sector = stream[pos + 2];
                    let id_length = stream[pos + 3];
                    pos += 4;

                    if id_track != fdc_track {
                        return Err(stream_err(format!(
                            "sector ID declares track {} but the track register is {}",
                            id_track, fdc_track
                        )));
                    }
                    if id_head != side {
                        return Err(stream_err(format!(
                            "sector ID declares head {} but side select is {}",
                            id_head, side
                        )));
                    }
                    let size = decode_sector_size(id_length).ok_or_else(|| {
                        stream_err(format!("invalid sector length code {:02X}h", id_length))
                    })?;
                    // The first ID record establishes the track's sector
                    // size; every subsequent record must agree.
                    if sector_ids.is_empty() {
                        sector_size = size;
                    }
                    else if size != sector_size {
                        return Err(stream_err(format!(
                            "sector {} declares size {} on a track of {}-byte sectors",
                            id_sector, size, sector_size
                        )));
                    }
                    if sector_ids.contains(&id_sector) {
                        return Err(stream_err(format!("sector {} appears twice", id_sector)));
                    }
                    sector_ids.push(id_sector);

                    log::trace!(
                        "WriteTrack stream: sector ID t:{} h:{} s:{} len:{}",
                        id_track,
                        id_head,
                        id_sector,
                        size
                    );
                    state = ParseState::DataRecordMark;
                }
                else {
                    pos += 1;
                }
            }
            ParseState::DataRecordMark => {
                if stream[pos] == DATA_RECORD_MARK {
                    pos += 1;
                    let data_start = pos;
                    while pos < stream.len() && stream[pos] != RECORD_END_MARK {
                        pos += 1;
                    }
                    if pos == stream.len() {
                        return Err(stream_err("data record missing end mark".to_string()));
                    }
                    let data_len = pos - data_start;
                    // Consume the end mark.
                    pos += 1;
                    if data_len != sector_size {
                        return Err(stream_err(format!(
                            "data record of {} bytes on a track of {}-byte sectors",
                            data_len, sector_size
                        )));
                    }
                    state = ParseState::IdRecordMark;
                }
                else {
                    pos += 1;
                }
            }
        }
    }

    // The index edge arrives between sectors; a stream that ends inside a
    // record never made it that far.
    if matches!(state, ParseState::DataRecordMark) {
        return Err(stream_err("stream ended before the last data record".to_string()));
    }
    if sector_ids.is_empty() {
        return Err(stream_err("stream contains no sector ID records".to_string()));
    }

    // Sectors must form the contiguous run 1..=N. Duplicates were rejected
    // above, so checking the bounds is sufficient.
    let sector_count = sector_ids.len() as u8;
    let max_id = *sector_ids.iter().max().unwrap();
    let min_id = *sector_ids.iter().min().unwrap();
    if min_id != 1 || max_id != sector_count {
        return Err(stream_err(format!(
            "sector IDs {:?} do not form a contiguous run from 1",
            sector_ids
        )));
    }

    Ok(TrackLayout {
        sector_count,
        sector_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a formatting stream the way host software does: leading gap,
    /// index mark, then ID and data records per sector.
    fn build_stream(double_density: bool, track: u8, sectors: &[(u8, u8)]) -> Vec<u8> {
        let gap = if double_density { GAP_BYTE_MFM } else { GAP_BYTE_FM };
        let mut stream = vec![gap; 16];
        stream.push(INDEX_MARK);
        for &(sector, length_code) in sectors {
            stream.extend_from_slice(&[gap; 8]);
            stream.push(ID_RECORD_MARK);
            stream.extend_from_slice(&[track, 0, sector, length_code]);
            stream.extend_from_slice(&[gap; 4]);
            stream.push(DATA_RECORD_MARK);
            stream.extend(std::iter::repeat(0x00).take(128usize << length_code));
            stream.push(RECORD_END_MARK);
        }
        stream
    }

    #[test]
    fn parses_double_density_layout() {
        let sectors: Vec<(u8, u8)> = (1..=9).map(|s| (s, 2)).collect();
        let stream = build_stream(true, 7, &sectors);

        let layout = parse_track_stream(&stream, true, 7, 0).unwrap();
        assert_eq!(layout.sector_count, 9);
        assert_eq!(layout.sector_size, 512);
    }

    #[test]
    fn parses_single_density_layout() {
        let sectors: Vec<(u8, u8)> = (1..=26).map(|s| (s, 0)).collect();
        let stream = build_stream(false, 0, &sectors);

        let layout = parse_track_stream(&stream, false, 0, 0).unwrap();
        assert_eq!(layout.sector_count, 26);
        assert_eq!(layout.sector_size, 128);
    }

    #[test]
    fn rejects_gap_byte_density_mismatch() {
        let stream = build_stream(false, 0, &[(1, 0)]);
        assert!(parse_track_stream(&stream, true, 0, 0).is_err());
    }

    #[test]
    fn rejects_varying_sector_size() {
        // Sector 5 declares 1024-byte sectors on a 512-byte track.
        let sectors: Vec<(u8, u8)> = (1..=9).map(|s| (s, if s == 5 { 3 } else { 2 })).collect();
        let stream = build_stream(true, 7, &sectors);
        assert!(parse_track_stream(&stream, true, 7, 0).is_err());
    }

    #[test]
    fn rejects_invalid_length_code() {
        let stream = build_stream(true, 0, &[(1, 4)]);
        assert!(parse_track_stream(&stream, true, 0, 0).is_err());
    }

    #[test]
    fn rejects_track_and_head_mismatches() {
        let stream = build_stream(true, 7, &[(1, 2)]);
        assert!(parse_track_stream(&stream, true, 6, 0).is_err());
        assert!(parse_track_stream(&stream, true, 7, 1).is_err());
    }

    #[test]
    fn rejects_duplicate_and_noncontiguous_sectors() {
        let stream = build_stream(true, 0, &[(1, 2), (2, 2), (2, 2)]);
        assert!(parse_track_stream(&stream, true, 0, 0).is_err());

        let stream = build_stream(true, 0, &[(1, 2), (2, 2), (4, 2)]);
        assert!(parse_track_stream(&stream, true, 0, 0).is_err());

        let stream = build_stream(true, 0, &[(2, 2), (3, 2)]);
        assert!(parse_track_stream(&stream, true, 0, 0).is_err());
    }

    #[test]
    fn rejects_truncated_records() {
        let mut stream = build_stream(true, 0, &[(1, 2)]);
        // Drop the final record-end mark.
        stream.pop();
        assert!(parse_track_stream(&stream, true, 0, 0).is_err());

        let stream = vec![GAP_BYTE_MFM, INDEX_MARK, ID_RECORD_MARK, 0, 0];
        assert!(parse_track_stream(&stream, true, 0, 0).is_err());
    }

    #[test]
    fn rejects_empty_track() {
        let stream = vec![GAP_BYTE_MFM; 32];
        assert!(parse_track_stream(&stream, true, 0, 0).is_err());
    }

    #[test]
    fn data_byte_count_must_match_declared_size() {
        let gap = GAP_BYTE_MFM;
        let mut stream = vec![gap, INDEX_MARK, ID_RECORD_MARK, 0, 0, 1, 2];
        stream.push(DATA_RECORD_MARK);
        // 100 bytes of data on a 512-byte sector.
        stream.extend(std::iter::repeat(0x00).take(100));
        stream.push(RECORD_END_MARK);
        assert!(parse_track_stream(&stream, true, 0, 0).is_err());
    }
}
