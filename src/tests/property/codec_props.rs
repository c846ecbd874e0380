//! Property-based tests for the PCM codecs

use proptest::prelude::*;

use crate::core::voice::codec::{decode_chunk, encode_chunk, read_wav, wav_bytes};

proptest! {
    /// Property: decode(encode(pcm)) reproduces every sample
    #[test]
    fn prop_chunk_codec_is_lossless(pcm in prop::collection::vec(any::<i16>(), 0..4096)) {
        let decoded = decode_chunk(&encode_chunk(&pcm)).unwrap();
        prop_assert_eq!(decoded, pcm);
    }

    /// Property: cached WAV files hold exactly the generated samples
    #[test]
    fn prop_wav_container_is_lossless(pcm in prop::collection::vec(any::<i16>(), 0..4096)) {
        let bytes = wav_bytes(&pcm).unwrap();
        prop_assert_eq!(bytes.len(), 44 + pcm.len() * 2);
        prop_assert_eq!(read_wav(&bytes).unwrap(), pcm);
    }
}
