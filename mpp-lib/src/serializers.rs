use serde::Deserialize;

/// Decodes a hex string into the 32 byte arrays used for hashes, preimages and payment addresses.
fn decode_32<E: serde::de::Error>(s: &str) -> Result<[u8; 32], E> {
    let bytes = hex::decode(s).map_err(E::custom)?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| E::custom(format!("expected 32 bytes, got {}", b.len())))
}

pub mod serde_payment_hash {
    use super::*;
    use lightning::ln::PaymentHash;

    pub fn serialize<S>(hash: &PaymentHash, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&hex::encode(hash.0))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PaymentHash, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(PaymentHash(decode_32(&s)?))
    }
}

pub mod serde_payment_secret {
    use super::*;
    use lightning::ln::PaymentSecret;

    pub fn serialize<S>(secret: &PaymentSecret, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&hex::encode(secret.0))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PaymentSecret, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(PaymentSecret(decode_32(&s)?))
    }
}

pub mod serde_payment_preimage {
    use super::*;
    use lightning::ln::PaymentPreimage;

    pub fn serialize<S>(preimage: &PaymentPreimage, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&hex::encode(preimage.0))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PaymentPreimage, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(PaymentPreimage(decode_32(&s)?))
    }
}

/// Serializes an optional preimage, writing an empty string when the preimage is not (yet) known.
pub mod serde_option_payment_preimage {
    use super::*;
    use lightning::ln::PaymentPreimage;

    pub fn serialize<S>(preimage: &Option<PaymentPreimage>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match preimage {
            Some(p) => serializer.serialize_str(&hex::encode(p.0)),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<PaymentPreimage>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(None);
        }

        Ok(Some(PaymentPreimage(decode_32(&s)?)))
    }
}

/// Serializes an optional timestamp as milliseconds since the unix epoch, or null if it is not set.
pub mod serde_option_system_time {
    use super::*;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn serialize<S>(time: &Option<SystemTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match time {
            Some(t) => {
                let millis = t
                    .duration_since(UNIX_EPOCH)
                    .map_err(serde::ser::Error::custom)?
                    .as_millis() as u64;
                serializer.serialize_some(&millis)
            },
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<SystemTime>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?
            .map(|millis| UNIX_EPOCH + Duration::from_millis(millis)))
    }
}
