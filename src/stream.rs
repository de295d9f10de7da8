//! The stream tag shared by stdio plumbing, the attach hub and the logging sink.

use strum::AsRefStr;

#[derive(AsRefStr, Clone, Copy, Debug, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
/// Identifies which container stream a chunk of bytes came from.
pub enum StreamTag {
    /// Bytes are headed toward the container's stdin.
    Stdin,

    /// Bytes came from the container's stdout.
    Stdout,

    /// Bytes came from the container's stderr.
    Stderr,
}

impl StreamTag {
    /// The byte written as the first octet of an attach seqpacket datagram.
    ///
    /// Matches the wire format fixed by spec §4.3/§6: 1 is reserved for
    /// stdin (attach never emits it), 2 is stdout, 3 is stderr.
    pub fn attach_byte(self) -> u8 {
        match self {
            StreamTag::Stdin => 1,
            StreamTag::Stdout => 2,
            StreamTag::Stderr => 3,
        }
    }

    /// The `STREAM` field of a CRI log record.
    pub fn cri_name(self) -> &'static str {
        match self {
            StreamTag::Stdin => "stdin",
            StreamTag::Stdout => "stdout",
            StreamTag::Stderr => "stderr",
        }
    }
}
