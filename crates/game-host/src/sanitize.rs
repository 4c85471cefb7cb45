//! Terminal control sequence stripping for log lines.
//!
//! Screen window logs are a raw copy of what the server wrote to its
//! terminal: colour codes, cursor movement, title updates and carriage
//! returns. Viewers want the text.

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

/// Remove CSI, OSC and two-byte escape sequences plus C0 control bytes
/// (tab excepted) from a single line.
pub fn strip_control_sequences(line: &str) -> String {
    let data = line.as_bytes();
    if !data.iter().any(|&b| (b < 0x20 && b != b'\t') || b == 0x7f) {
        return line.to_string();
    }

    let mut result = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        let b = data[i];
        if b == ESC {
            i = skip_escape(data, i);
            continue;
        }
        if (b < 0x20 && b != b'\t') || b == 0x7f {
            i += 1;
            continue;
        }
        result.push(b);
        i += 1;
    }

    String::from_utf8_lossy(&result).into_owned()
}

/// Index just past the escape sequence starting at `start`.
fn skip_escape(data: &[u8], start: usize) -> usize {
    let Some(&kind) = data.get(start + 1) else {
        return data.len();
    };
    match kind {
        // CSI: parameter and intermediate bytes, then one final byte
        b'[' => {
            let mut j = start + 2;
            while j < data.len() && (0x20..=0x3f).contains(&data[j]) {
                j += 1;
            }
            (j + 1).min(data.len())
        }
        // OSC: terminated by BEL or ST (ESC \)
        b']' => {
            let mut j = start + 2;
            while j < data.len() {
                if data[j] == BEL {
                    return j + 1;
                }
                if data[j] == ESC && data.get(j + 1) == Some(&b'\\') {
                    return j + 2;
                }
                j += 1;
            }
            data.len()
        }
        // Charset designation takes one more byte: ESC ( B
        b'(' | b')' | b'*' | b'+' => (start + 3).min(data.len()),
        _ => start + 2,
    }
}
