//! FLV tag bodies carried in RTMP audio, video and data messages

use bytes::{BufMut, Bytes, BytesMut};

use super::amf0::Amf0Value;
use crate::error::{AppError, Result};
use crate::stream::publisher::PublishOptions;

pub const NAL_SLICE_IDR: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

const CODEC_AVC: u8 = 7;
const CODEC_AAC: u8 = 10;
const AVC_SEQUENCE_HEADER: u8 = 0;
const AVC_NALU: u8 = 1;
const AAC_SEQUENCE_HEADER: u8 = 0;
const AAC_RAW: u8 = 1;

/// Locate the next start code at or after `from`: (offset, length)
fn next_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let window = data.get(from..)?;
    let pos = window.windows(3).position(|w| w == [0, 0, 1])?;
    let at = from + pos;
    // 00 00 00 01 is found as 00 00 01 one byte later
    if at > from && data[at - 1] == 0 {
        Some((at - 1, 4))
    } else {
        Some((at, 3))
    }
}

/// Split an Annex-B access unit into NAL units (start codes removed)
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let Some((first, len)) = next_start_code(data, 0) else {
        return units;
    };

    let mut begin = first + len;
    while begin < data.len() {
        let end = next_start_code(data, begin)
            .map(|(at, _)| at)
            .unwrap_or(data.len());
        let nal = &data[begin..end];
        let trimmed_len = nal.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
        if trimmed_len > 0 {
            units.push(&nal[..trimmed_len]);
        }
        match next_start_code(data, end) {
            Some((at, len)) if at == end => begin = at + len,
            _ => break,
        }
    }
    units
}

pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1f)
}

/// Latest SPS/PPS seen in the stream
#[derive(Debug, Clone, Default)]
pub struct ParameterSets {
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
}

impl ParameterSets {
    /// Record any SPS/PPS in `nals`, returning true when either changed
    pub fn update(&mut self, nals: &[&[u8]]) -> bool {
        let mut changed = false;
        for nal in nals {
            let slot = match nal_type(nal) {
                Some(NAL_SPS) => &mut self.sps,
                Some(NAL_PPS) => &mut self.pps,
                _ => continue,
            };
            if slot.as_deref() != Some(*nal) {
                *slot = Some(Bytes::copy_from_slice(nal));
                changed = true;
            }
        }
        changed
    }

    pub fn is_complete(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }
}

/// AVC sequence header: video tag prefix plus AVCDecoderConfigurationRecord
pub fn avc_sequence_header(sps: &[u8], pps: &[u8]) -> Result<Bytes> {
    if sps.len() < 4 {
        return Err(AppError::Internal(format!("SPS too short ({} bytes)", sps.len())));
    }
    let mut buf = BytesMut::with_capacity(16 + sps.len() + pps.len());
    buf.put_u8((1 << 4) | CODEC_AVC);
    buf.put_u8(AVC_SEQUENCE_HEADER);
    buf.put_slice(&[0, 0, 0]);

    buf.put_u8(1);
    buf.put_slice(&sps[1..4]);
    // 4 byte NALU lengths
    buf.put_u8(0xff);
    buf.put_u8(0xe1);
    buf.put_u16(sps.len() as u16);
    buf.put_slice(sps);
    buf.put_u8(1);
    buf.put_u16(pps.len() as u16);
    buf.put_slice(pps);
    Ok(buf.freeze())
}

/// AVC NALU tag in AVCC framing. Parameter sets and AUDs are left out;
/// returns None when nothing remains.
pub fn avc_nalu_tag(nals: &[&[u8]], keyframe: bool, composition_ms: i32) -> Option<Bytes> {
    let frame_type = if keyframe { 1 } else { 2 };
    let mut buf = BytesMut::new();
    buf.put_u8((frame_type << 4) | CODEC_AVC);
    buf.put_u8(AVC_NALU);
    let cts = composition_ms.to_be_bytes();
    buf.put_slice(&cts[1..]);

    let mut any = false;
    for nal in nals {
        if matches!(nal_type(nal), Some(NAL_SPS | NAL_PPS | NAL_AUD) | None) {
            continue;
        }
        buf.put_u32(nal.len() as u32);
        buf.put_slice(nal);
        any = true;
    }
    any.then(|| buf.freeze())
}

fn aac_flags(stereo: bool) -> u8 {
    // AAC, 44 kHz, 16 bit; the rate/size bits are fixed for AAC
    (CODEC_AAC << 4) | (3 << 2) | (1 << 1) | u8::from(stereo)
}

pub fn aac_sequence_header(audio_specific_config: &[u8], stereo: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + audio_specific_config.len());
    buf.put_u8(aac_flags(stereo));
    buf.put_u8(AAC_SEQUENCE_HEADER);
    buf.put_slice(audio_specific_config);
    buf.freeze()
}

pub fn aac_frame(data: &[u8], stereo: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + data.len());
    buf.put_u8(aac_flags(stereo));
    buf.put_u8(AAC_RAW);
    buf.put_slice(data);
    buf.freeze()
}

/// `@setDataFrame onMetaData {...}` announcing the stream layout
pub fn metadata(options: &PublishOptions) -> Bytes {
    let mut props = vec![
        ("width".to_string(), Amf0Value::Number(options.width as f64)),
        ("height".to_string(), Amf0Value::Number(options.height as f64)),
        ("framerate".to_string(), Amf0Value::Number(options.fps as f64)),
        ("videocodecid".to_string(), Amf0Value::Number(CODEC_AVC as f64)),
        (
            "videodatarate".to_string(),
            Amf0Value::Number(options.video_bitrate_bps as f64 / 1000.0),
        ),
    ];
    if let Some(audio) = options.audio {
        props.extend([
            ("audiocodecid".to_string(), Amf0Value::Number(CODEC_AAC as f64)),
            (
                "audiosamplerate".to_string(),
                Amf0Value::Number(audio.sample_rate as f64),
            ),
            ("stereo".to_string(), Amf0Value::Boolean(audio.stereo)),
            (
                "audiodatarate".to_string(),
                Amf0Value::Number(audio.bitrate_bps as f64 / 1000.0),
            ),
        ]);
    }

    let mut buf = BytesMut::with_capacity(256);
    Amf0Value::string("@setDataFrame").encode(&mut buf);
    Amf0Value::string("onMetaData").encode(&mut buf);
    Amf0Value::EcmaArray(props).encode(&mut buf);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::publisher::AudioParams;
    use crate::stream::rtmp::amf0::decode_all;

    const SPS: &[u8] = &[0x67, 0x42, 0xc0, 0x1f, 0xda, 0x01];
    const PPS: &[u8] = &[0x68, 0xce, 0x3c, 0x80];

    #[test]
    fn test_split_mixed_start_codes() {
        let data = [
            0, 0, 0, 1, 0x67, 0x42, 0, //
            0, 0, 1, 0x68, 0xce, //
            0, 0, 0, 1, 0x65, 0x88, 0x84, 0, 0,
        ];
        let nals = split_annexb(&data);
        assert_eq!(nals.len(), 3);
        assert_eq!(nals[0], &[0x67, 0x42]);
        assert_eq!(nals[1], &[0x68, 0xce]);
        assert_eq!(nals[2], &[0x65, 0x88, 0x84]);
        assert_eq!(nal_type(nals[2]), Some(NAL_SLICE_IDR));
    }

    #[test]
    fn test_split_without_start_code() {
        assert!(split_annexb(&[0x65, 0x88]).is_empty());
        assert!(split_annexb(&[0, 0, 1]).is_empty());
    }

    #[test]
    fn test_parameter_set_tracking() {
        let mut params = ParameterSets::default();
        assert!(params.update(&[SPS, PPS]));
        assert!(params.is_complete());
        assert!(!params.update(&[SPS, PPS, &[0x65, 0x01]]));
    }

    #[test]
    fn test_avc_sequence_header_layout() {
        let tag = avc_sequence_header(SPS, PPS).unwrap();
        assert_eq!(&tag[..5], &[0x17, 0x00, 0, 0, 0]);
        assert_eq!(&tag[5..9], &[0x01, 0x42, 0xc0, 0x1f]);
        assert_eq!(&tag[9..11], &[0xff, 0xe1]);
        assert_eq!(&tag[11..13], &[0x00, SPS.len() as u8]);
        let pps_at = 13 + SPS.len();
        assert_eq!(tag[pps_at], 1);
        assert_eq!(&tag[pps_at + 3..], PPS);

        assert!(avc_sequence_header(&[0x67], PPS).is_err());
    }

    #[test]
    fn test_nalu_tag_drops_parameter_sets() {
        let idr: &[u8] = &[0x65, 0x88, 0x84];
        let tag = avc_nalu_tag(&[&[0x09, 0xf0], SPS, PPS, idr], true, 0).unwrap();
        assert_eq!(&tag[..5], &[0x17, 0x01, 0, 0, 0]);
        assert_eq!(&tag[5..9], &[0, 0, 0, 3]);
        assert_eq!(&tag[9..], idr);

        assert!(avc_nalu_tag(&[SPS, PPS], true, 0).is_none());
        let inter = avc_nalu_tag(&[&[0x41, 0x9a]], false, 33).unwrap();
        assert_eq!(&inter[..5], &[0x27, 0x01, 0, 0, 33]);
    }

    #[test]
    fn test_aac_tags() {
        assert_eq!(&aac_sequence_header(&[0x12, 0x10], true)[..], &[0xaf, 0x00, 0x12, 0x10]);
        assert_eq!(&aac_frame(&[0x21], false)[..], &[0xae, 0x01, 0x21]);
    }

    #[test]
    fn test_metadata_announces_audio_when_enabled() {
        let mut options = PublishOptions::default();
        let values = decode_all(&metadata(&options)).unwrap();
        assert_eq!(values[0].as_str(), Some("@setDataFrame"));
        assert_eq!(values[1].as_str(), Some("onMetaData"));
        assert_eq!(values[2].get("width").and_then(Amf0Value::as_number), Some(1920.0));
        assert!(values[2].get("audiocodecid").is_none());

        options.audio = Some(AudioParams {
            sample_rate: 44100,
            stereo: true,
            bitrate_bps: 128_000,
        });
        let values = decode_all(&metadata(&options)).unwrap();
        assert_eq!(
            values[2].get("audiosamplerate").and_then(Amf0Value::as_number),
            Some(44100.0)
        );
    }
}
