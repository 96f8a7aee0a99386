//! CBOR helpers for the signed part of a quote.

use serde::{Serialize, de::DeserializeOwned};

pub fn to_vec<T>(value: &T) -> Result<Vec<u8>, ciborium::ser::Error<std::io::Error>>
where
    T: Serialize,
{
    let mut vec = Vec::new();
    ciborium::ser::into_writer(value, &mut vec)?;
    Ok(vec)
}

/// Decodes one value and refuses trailing bytes, so that a signature only ever
/// covers what the verifier actually reads.
pub fn from_slice_exact<T>(mut slice: &[u8]) -> anyhow::Result<T>
where
    T: DeserializeOwned,
{
    let value = ciborium::de::from_reader(&mut slice)?;
    anyhow::ensure!(
        slice.is_empty(),
        "{} trailing bytes after CBOR value",
        slice.len()
    );
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_bytes_are_rejected() -> anyhow::Result<()> {
        let mut encoded = to_vec(&(1u8, "a"))?;
        let decoded: (u8, String) = from_slice_exact(&encoded)?;
        assert_eq!(decoded, (1, "a".to_string()));

        encoded.push(0);
        assert!(from_slice_exact::<(u8, String)>(&encoded).is_err());
        Ok(())
    }
}
