//! Advertisement data parsing.
//!
//! Advertising data is a sequence of `[length][type][value...]` records where
//! `length` counts the type byte and the value. Zero-length records are
//! skipped; a truncated record ends the walk and whatever was decoded before
//! it is kept.

use uuid::Uuid;

pub(crate) mod ad_type {
    pub const INCOMPLETE_UUID16: u8 = 0x02;
    pub const COMPLETE_UUID16: u8 = 0x03;
    pub const INCOMPLETE_UUID32: u8 = 0x04;
    pub const COMPLETE_UUID32: u8 = 0x05;
    pub const INCOMPLETE_UUID128: u8 = 0x06;
    pub const COMPLETE_UUID128: u8 = 0x07;
    pub const SHORTENED_LOCAL_NAME: u8 = 0x08;
    pub const COMPLETE_LOCAL_NAME: u8 = 0x09;
    pub const MANUFACTURER_SPECIFIC: u8 = 0xFF;
}

/// Bluetooth base UUID `00000000-0000-1000-8000-00805f9b34fb`
const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Manufacturer specific advertisement field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManufacturerData {
    pub company_id: u16,
    pub payload: Vec<u8>,
}

impl ManufacturerData {
    pub fn company_name(&self) -> &'static str {
        match self.company_id {
            0x0397 => "LEGO System A/S",
            _ => "?",
        }
    }
}

/// Iterator over the `(type, value)` records of an advertisement
struct Records<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for Records<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let data = self.data;
            let [len, rest @ ..] = data else {
                return None;
            };
            let len = *len as usize;
            if rest.len() < len {
                self.data = &[];
                return None;
            }
            let (record, remaining) = rest.split_at(len);
            self.data = remaining;
            // An empty record carries no type byte; step over its length byte.
            if let [kind, value @ ..] = record {
                return Some((*kind, value));
            }
        }
    }
}

fn records(data: &[u8]) -> Records<'_> {
    Records { data }
}

/// Expand a 16 or 32-bit SIG assigned number over the base UUID.
pub fn uuid_from_short(short: u32) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Decode every advertised service UUID, in advertised order, without duplicates.
pub fn decode_services(data: &[u8]) -> Vec<Uuid> {
    let mut services = Vec::new();

    for (kind, value) in records(data) {
        let decoded: Vec<Uuid> = match kind {
            ad_type::INCOMPLETE_UUID16 | ad_type::COMPLETE_UUID16 => value
                .chunks_exact(2)
                .map(|c| uuid_from_short(u16::from_le_bytes([c[0], c[1]]) as u32))
                .collect(),
            ad_type::INCOMPLETE_UUID32 | ad_type::COMPLETE_UUID32 => value
                .chunks_exact(4)
                .map(|c| uuid_from_short(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                .collect(),
            ad_type::INCOMPLETE_UUID128 | ad_type::COMPLETE_UUID128 => value
                .chunks_exact(16)
                .map(|c| {
                    let mut bytes = [0u8; 16];
                    bytes.copy_from_slice(c);
                    Uuid::from_u128(u128::from_le_bytes(bytes))
                })
                .collect(),
            _ => continue,
        };

        for uuid in decoded {
            if !services.contains(&uuid) {
                services.push(uuid);
            }
        }
    }

    services
}

/// Decode the first manufacturer specific record.
pub fn decode_manufacturer(data: &[u8]) -> Option<ManufacturerData> {
    records(data)
        .find(|(kind, _)| *kind == ad_type::MANUFACTURER_SPECIFIC)
        .and_then(|(_, value)| match value {
            [lo, hi, payload @ ..] => Some(ManufacturerData {
                company_id: u16::from_le_bytes([*lo, *hi]),
                payload: payload.to_vec(),
            }),
            _ => None,
        })
}

/// Extract the complete local name, or the shortened name if that is all
/// the peripheral advertised.
pub fn decode_name(data: &[u8]) -> Option<String> {
    let mut shortened = None;
    for (kind, value) in records(data) {
        match kind {
            ad_type::COMPLETE_LOCAL_NAME => return Some(String::from_utf8_lossy(value).into_owned()),
            ad_type::SHORTENED_LOCAL_NAME if shortened.is_none() => {
                shortened = Some(String::from_utf8_lossy(value).into_owned());
            }
            _ => {}
        }
    }
    shortened
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::SERVICE_UUID;

    /// Advertisement of a Powered Up remote as captured from the air.
    fn remote_advertisement() -> Vec<u8> {
        let mut data = vec![0x02, 0x01, 0x06]; // flags
        data.push(0x11);
        data.push(0x07);
        data.extend_from_slice(&SERVICE_UUID.as_u128().to_le_bytes());
        data.extend_from_slice(&[0x09, 0xFF, 0x97, 0x03, 0x00, 0x42, 0x06, 0x00, 0x41, 0x00]);
        data
    }

    #[test]
    fn decodes_lego_service_uuid() {
        let services = decode_services(&remote_advertisement());
        assert_eq!(services, vec![SERVICE_UUID]);
    }

    #[test]
    fn decode_is_deterministic() {
        let data = remote_advertisement();
        assert_eq!(decode_services(&data), decode_services(&data));
        assert_eq!(decode_manufacturer(&data), decode_manufacturer(&data));
    }

    #[test]
    fn decodes_short_uuids_over_base() {
        let data = [
            0x05, 0x03, 0x0F, 0x18, 0x12, 0x18, // battery, HID
            0x05, 0x05, 0x34, 0x12, 0x00, 0x00, // 32-bit 0x00001234
        ];
        let services = decode_services(&data);
        assert_eq!(
            services,
            vec![
                Uuid::parse_str("0000180f-0000-1000-8000-00805f9b34fb").unwrap(),
                Uuid::parse_str("00001812-0000-1000-8000-00805f9b34fb").unwrap(),
                Uuid::parse_str("00001234-0000-1000-8000-00805f9b34fb").unwrap(),
            ]
        );
    }

    #[test]
    fn duplicate_uuids_are_collapsed() {
        let data = [0x03, 0x02, 0x12, 0x18, 0x03, 0x03, 0x12, 0x18];
        assert_eq!(decode_services(&data).len(), 1);
    }

    #[test]
    fn decodes_manufacturer_payload() {
        let man = decode_manufacturer(&remote_advertisement()).unwrap();
        assert_eq!(man.company_id, 0x0397);
        assert_eq!(man.company_name(), "LEGO System A/S");
        assert_eq!(man.payload, vec![0x00, 0x42, 0x06, 0x00, 0x41, 0x00]);
    }

    #[test]
    fn manufacturer_record_too_short() {
        assert_eq!(decode_manufacturer(&[0x02, 0xFF, 0x97]), None);
        assert_eq!(decode_manufacturer(&[0x02, 0x01, 0x06]), None);
    }

    #[test]
    fn extracts_names() {
        let complete = [0x0A, 0x09, b'H', b'a', b'n', b'd', b's', b'e', b't', b' ', b'1'];
        assert_eq!(decode_name(&complete).as_deref(), Some("Handset 1"));

        let shortened = [0x05, 0x08, b'H', b'a', b'n', b'd'];
        assert_eq!(decode_name(&shortened).as_deref(), Some("Hand"));

        assert_eq!(decode_name(&[0x02, 0x01, 0x06]), None);
    }

    #[test]
    fn truncated_record_keeps_earlier_fields() {
        let data = [
            0x03, 0x03, 0x23, 0x16, // 16-bit 0x1623
            0x11, 0x07, 0xAA, 0xBB, // claims 16 bytes, only two present
        ];
        assert_eq!(decode_services(&data), vec![uuid_from_short(0x1623)]);
    }

    #[test]
    fn zero_length_record_is_skipped() {
        let data = [0x00, 0x03, 0x03, 0x12, 0x18];
        assert_eq!(
            decode_services(&data),
            vec![Uuid::parse_str("00001812-0000-1000-8000-00805f9b34fb").unwrap()]
        );

        let padded = [0x00, 0x00, 0x05, 0x08, b'H', b'a', b'n', b'd', 0x00];
        assert_eq!(decode_name(&padded).as_deref(), Some("Hand"));
        assert!(decode_services(&[]).is_empty());
        assert!(decode_services(&[0x00, 0x00]).is_empty());
    }

    #[test]
    fn odd_uuid_list_ignores_partial_entry() {
        let data = [0x04, 0x03, 0x12, 0x18, 0x0F];
        assert_eq!(decode_services(&data), vec![uuid_from_short(0x1812)]);
    }
}
