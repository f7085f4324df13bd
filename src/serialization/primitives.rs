use crate::error::{ClientError, IoErrorContext};
use crate::protocol::{ProtocolVersion, MAX_STRING_LIST_SIZE, MAX_STRING_SIZE};
use crate::serialization::{padding, Deserialize, Serialize, ZEROS};
use std::collections::{BTreeMap, BTreeSet};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

impl Serialize for () {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        _writer: &mut W,
        _version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        Ok(())
    }
}

impl Deserialize for () {
    async fn deserialize<R: AsyncRead + Unpin>(
        _reader: &mut R,
        _version: ProtocolVersion,
    ) -> Result<Self, ClientError> {
        Ok(())
    }
}

impl Serialize for u64 {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        _version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        writer
            .write_all(&self.to_le_bytes())
            .await
            .io_context("Failed to write u64")
    }
}

impl Deserialize for u64 {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        _version: ProtocolVersion,
    ) -> Result<Self, ClientError> {
        let mut buf = [0; 8];
        reader
            .read_exact(&mut buf)
            .await
            .io_context("Failed to read u64")?;
        Ok(u64::from_le_bytes(buf))
    }
}

impl Serialize for bool {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        (*self as u64).serialize(writer, version).await
    }
}

impl Deserialize for bool {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ClientError> {
        Ok(u64::deserialize(reader, version).await? != 0)
    }
}

impl Serialize for [u8] {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        let len = self.len() as u64;
        len.serialize(writer, version).await?;
        writer
            .write_all(self)
            .await
            .io_context("Failed to write string data")?;
        let pad = padding(len);
        if pad > 0 {
            writer
                .write_all(&ZEROS[..pad])
                .await
                .io_context("Failed to write string padding")?;
        }
        Ok(())
    }
}

impl Serialize for Vec<u8> {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        self.as_slice().serialize(writer, version).await
    }
}

impl Deserialize for Vec<u8> {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ClientError> {
        let len = u64::deserialize(reader, version)
            .await
            .io_context("Failed to read string length")?;

        if len > MAX_STRING_SIZE {
            return Err(ClientError::StringTooLong {
                length: len,
                max: MAX_STRING_SIZE,
            });
        }

        // Read data and padding in one go, then cut the padding off.
        let aligned = (len + 7) & !7;
        let mut buf = vec![0; aligned as usize];
        reader
            .read_exact(&mut buf)
            .await
            .io_context("Failed to read string data")?;
        buf.truncate(len as usize);
        Ok(buf)
    }
}

impl Serialize for str {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        self.as_bytes().serialize(writer, version).await
    }
}

impl Serialize for String {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        self.as_bytes().serialize(writer, version).await
    }
}

impl Deserialize for String {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ClientError> {
        let bytes = Vec::<u8>::deserialize(reader, version).await?;
        String::from_utf8(bytes)
            .map_err(|e| ClientError::Malformed(format!("invalid UTF-8 in string: {e}")))
    }
}

fn check_list_len(len: u64) -> Result<(), ClientError> {
    if len > MAX_STRING_LIST_SIZE {
        return Err(ClientError::StringListTooLong {
            length: len,
            max: MAX_STRING_LIST_SIZE,
        });
    }
    Ok(())
}

impl<T: Serialize> Serialize for [T] {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        check_list_len(self.len() as u64)?;
        (self.len() as u64).serialize(writer, version).await?;
        for item in self {
            item.serialize(writer, version).await?;
        }
        Ok(())
    }
}

impl<T: Serialize> Serialize for Vec<T> {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        self.as_slice().serialize(writer, version).await
    }
}

impl<T: Deserialize> Deserialize for Vec<T> {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ClientError> {
        let len = u64::deserialize(reader, version)
            .await
            .io_context("Failed to read list length")?;
        check_list_len(len)?;

        let mut result = Vec::with_capacity(len as usize);
        for _ in 0..len {
            result.push(T::deserialize(reader, version).await?);
        }
        Ok(result)
    }
}

// Sets are encoded as count + elements; the sender may use any order,
// so decoding collects into an ordered set without caring.
impl<T: Serialize> Serialize for BTreeSet<T> {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        check_list_len(self.len() as u64)?;
        (self.len() as u64).serialize(writer, version).await?;
        for item in self {
            item.serialize(writer, version).await?;
        }
        Ok(())
    }
}

impl<T: Deserialize + Ord> Deserialize for BTreeSet<T> {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ClientError> {
        let len = u64::deserialize(reader, version)
            .await
            .io_context("Failed to read set length")?;
        check_list_len(len)?;

        let mut result = BTreeSet::new();
        for _ in 0..len {
            result.insert(T::deserialize(reader, version).await?);
        }
        Ok(result)
    }
}

impl<K: Serialize, V: Serialize> Serialize for BTreeMap<K, V> {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ClientError> {
        check_list_len(self.len() as u64)?;
        (self.len() as u64).serialize(writer, version).await?;
        for (key, value) in self {
            key.serialize(writer, version).await?;
            value.serialize(writer, version).await?;
        }
        Ok(())
    }
}

impl<K: Deserialize + Ord, V: Deserialize> Deserialize for BTreeMap<K, V> {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ClientError> {
        let len = u64::deserialize(reader, version)
            .await
            .io_context("Failed to read map length")?;
        check_list_len(len)?;

        let mut result = BTreeMap::new();
        for _ in 0..len {
            let key = K::deserialize(reader, version).await?;
            let value = V::deserialize(reader, version).await?;
            result.insert(key, value);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CLIENT_PROTOCOL_VERSION;
    use std::io::Cursor;

    async fn round_trip<T>(value: &T) -> T
    where
        T: Serialize + Deserialize,
    {
        let mut buf = Vec::new();
        value
            .serialize(&mut buf, CLIENT_PROTOCOL_VERSION)
            .await
            .unwrap();
        let mut cursor = Cursor::new(buf);
        T::deserialize(&mut cursor, CLIENT_PROTOCOL_VERSION)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn u64_round_trip() {
        assert_eq!(round_trip(&42u64).await, 42);
        assert_eq!(round_trip(&u64::MAX).await, u64::MAX);
    }

    #[tokio::test]
    async fn bool_is_a_u64() {
        let mut buf = Vec::new();
        true.serialize(&mut buf, CLIENT_PROTOCOL_VERSION)
            .await
            .unwrap();
        assert_eq!(buf, 1u64.to_le_bytes());
    }

    #[tokio::test]
    async fn string_is_padded_to_eight_bytes() {
        let mut buf = Vec::new();
        "test"
            .to_string()
            .serialize(&mut buf, CLIENT_PROTOCOL_VERSION)
            .await
            .unwrap();
        // 8 bytes length + 4 bytes data + 4 bytes padding
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[12..], &[0, 0, 0, 0]);

        let mut buf = Vec::new();
        "12345678"
            .to_string()
            .serialize(&mut buf, CLIENT_PROTOCOL_VERSION)
            .await
            .unwrap();
        // exact multiple needs no padding
        assert_eq!(buf.len(), 16);
    }

    #[tokio::test]
    async fn string_round_trip() {
        for s in ["", "a", "hello world", "12345678"] {
            assert_eq!(round_trip(&s.to_string()).await, s);
        }
    }

    #[tokio::test]
    async fn collections_round_trip() {
        let vec = vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()];
        assert_eq!(round_trip(&vec).await, vec);

        let set: BTreeSet<String> = ["b", "a", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(round_trip(&set).await, set);

        let map: BTreeMap<String, u64> =
            [("x".to_string(), 1u64), ("y".to_string(), 2u64)].into();
        assert_eq!(round_trip(&map).await, map);
    }

    #[tokio::test]
    async fn over_long_string_is_rejected() {
        let mut buf = Vec::new();
        (MAX_STRING_SIZE + 1)
            .serialize(&mut buf, CLIENT_PROTOCOL_VERSION)
            .await
            .unwrap();
        let mut cursor = Cursor::new(buf);
        let err = Vec::<u8>::deserialize(&mut cursor, CLIENT_PROTOCOL_VERSION)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::StringTooLong { .. }));
    }

    #[tokio::test]
    async fn short_read_is_an_error() {
        // Length claims 8 bytes but only 3 follow.
        let mut buf = Vec::new();
        8u64.serialize(&mut buf, CLIENT_PROTOCOL_VERSION)
            .await
            .unwrap();
        buf.extend_from_slice(b"abc");
        let mut cursor = Cursor::new(buf);
        let err = Vec::<u8>::deserialize(&mut cursor, CLIENT_PROTOCOL_VERSION)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Io { .. }));
    }

    #[tokio::test]
    async fn decoder_accepts_unsorted_sets() {
        let mut buf = Vec::new();
        2u64.serialize(&mut buf, CLIENT_PROTOCOL_VERSION)
            .await
            .unwrap();
        "zzz".serialize(&mut buf, CLIENT_PROTOCOL_VERSION)
            .await
            .unwrap();
        "aaa".serialize(&mut buf, CLIENT_PROTOCOL_VERSION)
            .await
            .unwrap();
        let mut cursor = Cursor::new(buf);
        let set = BTreeSet::<String>::deserialize(&mut cursor, CLIENT_PROTOCOL_VERSION)
            .await
            .unwrap();
        assert_eq!(set.iter().next().map(String::as_str), Some("aaa"));
    }
}
