//! Feature bitmaps exchanged with `AT+BRSF` and the codec identifiers used
//! during codec negotiation.

use bitflags::bitflags;

use crate::config::MAX_CODECS;

/// CVSD, the mandatory narrowband codec.
pub const CODEC_CVSD: u8 = 1;
/// mSBC, the wideband codec introduced with HFP 1.6.
pub const CODEC_MSBC: u8 = 2;

/// A list of codec ids in preference order.
pub type CodecList = heapless::Vec<u8, MAX_CODECS>;

bitflags! {
    /// AG supported features bitmap (HFP v1.7 section 4.34.1, `+BRSF` value).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AgFeatures: u32 {
        const THREE_WAY_CALLING      = 1 << 0;
        const NR_EC                  = 1 << 1;
        const VOICE_RECOGNITION      = 1 << 2;
        const IN_BAND_RING_TONE      = 1 << 3;
        const VOICE_TAG              = 1 << 4;
        const REJECT_CALL            = 1 << 5;
        const ENHANCED_CALL_STATUS   = 1 << 6;
        const ENHANCED_CALL_CONTROL  = 1 << 7;
        const EXTENDED_ERROR_CODES   = 1 << 8;
        const CODEC_NEGOTIATION      = 1 << 9;
        const HF_INDICATORS          = 1 << 10;
        const ESCO_S4                = 1 << 11;
    }
}

bitflags! {
    /// HF supported features bitmap (HFP v1.7 section 4.34.2, `AT+BRSF` value).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HfFeatures: u32 {
        const NR_EC                  = 1 << 0;
        const THREE_WAY_CALLING      = 1 << 1;
        const CLI_PRESENTATION       = 1 << 2;
        const VOICE_RECOGNITION      = 1 << 3;
        const REMOTE_VOLUME_CONTROL  = 1 << 4;
        const ENHANCED_CALL_STATUS   = 1 << 5;
        const ENHANCED_CALL_CONTROL  = 1 << 6;
        const CODEC_NEGOTIATION      = 1 << 7;
        const HF_INDICATORS          = 1 << 8;
        const ESCO_S4                = 1 << 9;
    }
}

impl Default for AgFeatures {
    fn default() -> Self {
        Self::empty()
    }
}

impl Default for HfFeatures {
    fn default() -> Self {
        Self::empty()
    }
}

/// Picks the codec to suggest in `+BCS`: the first entry of the AG preference
/// list that the HF also advertised, or 0 when the lists share nothing.
pub(crate) fn common_codec(ag_codecs: &[u8], hf_codecs: &[u8]) -> u8 {
    ag_codecs
        .iter()
        .copied()
        .find(|codec| hf_codecs.contains(codec))
        .unwrap_or(0)
}
