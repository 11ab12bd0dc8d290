use uuid::Uuid;

const BASE62: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Opaque public-facing id for async tasks.
///
/// Decouples clients from upstream task ids; never reversible back to them.
pub fn new_short_id() -> String {
    let mut value = Uuid::new_v4().as_u128();
    let mut out = Vec::with_capacity(22);
    while value > 0 {
        out.push(BASE62[(value % 62) as usize]);
        value /= 62;
    }
    while out.len() < 22 {
        out.push(b'0');
    }
    out.reverse();
    String::from_utf8(out).expect("base62 output is ascii")
}

pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_ids_are_fixed_width_and_unique() {
        let a = new_short_id();
        let b = new_short_id();
        assert_eq!(a.len(), 22);
        assert_eq!(b.len(), 22);
        assert_ne!(a, b);
        assert!(a.bytes().all(|c| c.is_ascii_alphanumeric()));
    }
}
