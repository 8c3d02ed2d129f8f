use nix::libc;
use std::{
    fs::File,
    io,
    os::{fd::AsRawFd, unix::fs::OpenOptionsExt},
};

// Format
pub const AFMT_U8: u32 = 0x00000008;
pub const AFMT_S16_LE: u32 = 0x00000010;
pub const AFMT_S16_BE: u32 = 0x00000020;
pub const AFMT_S8: u32 = 0x00000040;
pub const AFMT_S32_LE: u32 = 0x00001000;

// Direction bits, as used by the audio I/O parameters
pub const DIRECTION_READ: u32 = 1;
pub const DIRECTION_WRITE: u32 = 2;

/// Requested device setup. The driver may adjust any of these; the values it
/// settled on are reported back in [`Dsp`].
#[derive(Debug, Clone)]
pub struct DspRequest {
    pub path: String,
    pub rate: i32,
    pub channels: i32,
    pub bits: i32,
    pub fragment_size: i32,
    pub fragment_count: i32,
    pub direction: u32,
}

/// An opened and configured `/dev/dsp` style device.
#[derive(Debug)]
pub struct Dsp {
    pub dsp: File,
    pub channels: i32,
    pub rate: i32,
    pub format: u32,
    pub fragment_size: i32,
    pub fragment_count: i32,
}

pub fn format_for_bits(bits: i32) -> io::Result<u32> {
    match bits {
        8 => Ok(AFMT_U8),
        16 => Ok(AFMT_S16_LE),
        32 => Ok(AFMT_S32_LE),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no sample format with {bits} bits"),
        )),
    }
}

/// Encodes the SNDCTL_DSP_SETFRAGMENT argument: fragment count in the upper
/// 16 bits, log2 of the fragment size in the lower ones.
pub fn fragment_arg(fragment_size: i32, fragment_count: i32) -> i32 {
    let mut log2 = 0;
    while log2 < 30 && (1 << (log2 + 1)) <= fragment_size.max(1) {
        log2 += 1;
    }
    ((fragment_count & 0x7fff) << 16) | log2
}

impl Dsp {
    pub fn open(request: &DspRequest) -> io::Result<Dsp> {
        let readable = request.direction & DIRECTION_READ != 0;
        let writable = request.direction & DIRECTION_WRITE != 0;
        if !readable && !writable {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid direction {}", request.direction),
            ));
        }
        let dsp = File::options()
            .read(readable)
            .write(writable)
            .custom_flags(libc::O_CLOEXEC)
            .open(&request.path)?;

        let mut format = format_for_bits(request.bits)?;
        let mut channels = request.channels;
        let mut rate = request.rate;
        let mut fragment = fragment_arg(request.fragment_size, request.fragment_count);
        let mut buffer_info = BufferInfo::new();
        unsafe {
            let fd = dsp.as_raw_fd();

            // Fragment layout has to be requested before anything else
            oss_set_fragment(fd, &mut fragment).map_err(io::Error::from)?;
            oss_set_format(fd, &mut format).map_err(io::Error::from)?;
            oss_channels(fd, &mut channels).map_err(io::Error::from)?;
            oss_set_speed(fd, &mut rate).map_err(io::Error::from)?;

            if writable {
                oss_output_space(fd, &mut buffer_info).map_err(io::Error::from)?;
            } else {
                oss_input_space(fd, &mut buffer_info).map_err(io::Error::from)?;
            }
        }
        if format != format_for_bits(request.bits)? {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("device refused {} bit samples", request.bits),
            ));
        }
        Ok(Dsp {
            dsp,
            channels,
            rate,
            format,
            fragment_size: buffer_info.fragsize,
            fragment_count: buffer_info.fragstotal,
        })
    }
}

#[repr(C)]
struct BufferInfo {
    pub fragments: libc::c_int,
    pub fragstotal: libc::c_int,
    pub fragsize: libc::c_int,
    pub bytes: libc::c_int,
}

impl BufferInfo {
    pub fn new() -> BufferInfo {
        BufferInfo {
            fragments: 0,
            fragstotal: 0,
            fragsize: 0,
            bytes: 0,
        }
    }
}

const SNDCTL_DSP_MAGIC: u8 = b'P';
const SNDCTL_DSP_SPEED: u8 = 2;
const SNDCTL_DSP_SETFMT: u8 = 5;
const SNDCTL_DSP_CHANNELS: u8 = 6;
const SNDCTL_DSP_SETFRAGMENT: u8 = 10;
const SNDCTL_DSP_GETOSPACE: u8 = 12;
const SNDCTL_DSP_GETISPACE: u8 = 13;
nix::ioctl_readwrite!(oss_channels, SNDCTL_DSP_MAGIC, SNDCTL_DSP_CHANNELS, i32);
nix::ioctl_readwrite!(oss_set_fragment, SNDCTL_DSP_MAGIC, SNDCTL_DSP_SETFRAGMENT, i32);
nix::ioctl_read!(
    oss_output_space,
    SNDCTL_DSP_MAGIC,
    SNDCTL_DSP_GETOSPACE,
    BufferInfo
);
nix::ioctl_read!(
    oss_input_space,
    SNDCTL_DSP_MAGIC,
    SNDCTL_DSP_GETISPACE,
    BufferInfo
);
nix::ioctl_readwrite!(oss_set_format, SNDCTL_DSP_MAGIC, SNDCTL_DSP_SETFMT, u32);
nix::ioctl_readwrite!(oss_set_speed, SNDCTL_DSP_MAGIC, SNDCTL_DSP_SPEED, i32);

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn fragment_arg_packs_count_and_log2_size() {
        assert_eq!(fragment_arg(1024, 3), (3 << 16) | 10);
        assert_eq!(fragment_arg(4096, 7), (7 << 16) | 12);
        // Non power of two sizes round down
        assert_eq!(fragment_arg(1500, 2), (2 << 16) | 10);
    }

    #[test]
    fn bits_map_to_formats() {
        assert_eq!(format_for_bits(8).unwrap(), AFMT_U8);
        assert_eq!(format_for_bits(16).unwrap(), AFMT_S16_LE);
        assert!(format_for_bits(24).is_err());
    }

    #[test]
    fn open_rejects_empty_direction() {
        let request = DspRequest {
            path: "/dev/dsp".to_string(),
            rate: 44100,
            channels: 2,
            bits: 16,
            fragment_size: 1024,
            fragment_count: 3,
            direction: 0,
        };
        let err = Dsp::open(&request).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    #[ignore = "requires OSS hardware"]
    fn plays_silence() {
        let request = DspRequest {
            path: "/dev/dsp".to_string(),
            rate: 44100,
            channels: 2,
            bits: 16,
            fragment_size: 1024,
            fragment_count: 3,
            direction: DIRECTION_WRITE,
        };
        let mut oss = Dsp::open(&request).unwrap();
        let silence = vec![0u8; oss.fragment_size.max(1) as usize];
        for _ in 0..8 {
            oss.dsp.write_all(&silence).unwrap();
        }
    }
}
