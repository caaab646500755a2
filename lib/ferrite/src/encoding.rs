/// Helpers around the standard base64 alphabet, used for key material at rest.
pub mod base64 {
    use ::base64::engine::general_purpose::STANDARD;
    use ::base64::Engine;

    pub use ::base64::DecodeError;

    #[inline]
    pub fn encode(data: &[u8]) -> String {
        STANDARD.encode(data)
    }

    #[inline]
    pub fn decode(text: &str) -> Result<Vec<u8>, DecodeError> {
        STANDARD.decode(text)
    }
}

#[cfg(test)]
mod tests {
    use super::base64;

    #[test]
    fn test_roundtrip() {
        let data = [1u8, 2, 3, 250, 251, 252];
        let encoded = base64::encode(&data);
        assert_eq!(base64::decode(&encoded).unwrap(), &data[..]);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(base64::decode("not//valid==base64!").is_err());
    }
}
