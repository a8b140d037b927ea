//! Internet checksum (RFC 1071) used by the ICMP codec.

/// Computes the one's complement checksum of `data`.
///
/// The checksum field inside `data` must be zeroed beforehand, otherwise the
/// result will not validate on the remote side.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum = sum_be_words(data);
    while sum >> 16 != 0 {
        sum = (sum >> 16) + (sum & 0xFFFF);
    }

    !sum as u16 // The checksum field should be the ones complement of the sum
}

/// Zeroes the 16 bit word at byte `offset`, computes the checksum over the
/// whole buffer and writes it back in network byte order.
pub fn set_checksum(data: &mut [u8], offset: usize) {
    data[offset] = 0;
    data[offset + 1] = 0;
    let sum = checksum(data);
    data[offset..offset + 2].copy_from_slice(&sum.to_be_bytes());
}

/// A buffer carrying a correct checksum sums to all ones, so its checksum is zero.
pub fn verify(data: &[u8]) -> bool {
    checksum(data) == 0
}

/// Sum all words (16 bit chunks) in the given data. Each word is treated as
/// big endian; a trailing odd byte is the low byte of a final word.
fn sum_be_words(data: &[u8]) -> u32 {
    data.chunks(2)
        .map(|word| match *word {
            [w] => w as u16,
            [wh, wl] => u16::from_be_bytes([wh, wl]),
            _ => unreachable!(),
        })
        .fold(0u32, |acc, w| acc.wrapping_add(w as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    /// Independent one's complement sum using little endian words.
    fn reference_checksum(data: &[u8]) -> u16 {
        let mut sum: u64 = 0;
        for word in data.chunks_exact(2) {
            sum += u16::from_le_bytes([word[0], word[1]]) as u64;
        }
        while sum > 0xFFFF {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        !(sum as u16)
    }

    #[test]
    fn known_vector() {
        // Example header from RFC 1071 section 3
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), !0xddf2);
    }

    #[test]
    fn empty_buffer_checksums_to_all_ones() {
        assert_eq!(checksum(&[]), 0xFFFF);
    }

    #[test]
    fn odd_trailing_byte_is_low_byte() {
        assert_eq!(checksum(&[0x12, 0x34, 0x56]), !(0x1234u16 + 0x0056));
    }

    #[test]
    fn carries_are_folded() {
        let data = [0xFF; 64];
        // 32 words of 0xFFFF fold back to 0xFFFF
        assert_eq!(checksum(&data), 0);
    }

    #[test]
    fn inserted_checksum_self_verifies_for_random_buffers() {
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let len = rng.gen_range(2, 512) & !1;
            let mut buf: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let offset = rng.gen_range(0, len / 2) * 2;

            set_checksum(&mut buf, offset);

            assert!(verify(&buf));
            assert_eq!(reference_checksum(&buf), 0, "buffer of {} bytes", len);
        }
    }

    #[test]
    fn corrupted_buffer_fails_verification() {
        let mut buf = vec![8, 0, 0, 0, 0, 0, 0, 1, 0xAA, 0x55];
        set_checksum(&mut buf, 2);
        buf[9] ^= 0x01;
        assert!(!verify(&buf));
    }
}
