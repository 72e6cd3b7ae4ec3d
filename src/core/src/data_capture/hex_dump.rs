use std::fmt::Write;

const BYTES_PER_LINE: usize = 16;

/// Renders `data` as a canonical hex dump, 16 bytes per line:
///
/// ```text
/// 00000000  50 49 4E 47                                       |PING|
/// ```
///
/// Offsets restart at zero for every call. Non printable bytes are shown as
/// `.` in the character column.
pub fn hex_dump(data: &[u8]) -> String {
    let lines = data.len().div_ceil(BYTES_PER_LINE);
    let mut out = String::with_capacity(lines * 79);

    for (line, chunk) in data.chunks(BYTES_PER_LINE).enumerate() {
        let _ = write!(out, "{:08X}  ", line * BYTES_PER_LINE);
        for i in 0..BYTES_PER_LINE {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{:02X} ", b);
                }
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        out.extend(chunk.iter().map(|&b| printable(b)));
        out.push_str("|\n");
    }
    out
}

fn printable(b: u8) -> char {
    if (0x20..=0x7e).contains(&b) {
        b as char
    } else {
        '.'
    }
}
