use uuid::Uuid;

/// 生成 `bytes` 字节长度的十六进制随机串（探测请求里的 nonce，避免命中上游缓存）。
pub fn nonce_hex(bytes: usize) -> String {
    let mut out = String::with_capacity(bytes * 2);
    while out.len() < bytes * 2 {
        for b in random_u64().to_le_bytes() {
            if out.len() >= bytes * 2 {
                break;
            }
            out.push_str(&format!("{b:02x}"));
        }
    }
    out
}

/// Claude 探测请求使用的 metadata.user_id。
pub fn probe_user_id(nonce: &str) -> String {
    format!("user_{nonce}_account__session_{}", Uuid::new_v4())
}

fn random_u64() -> u64 {
    // 复用 UUID v4 的随机源，避免额外引入 rand/getrandom 依赖。
    let b = *Uuid::new_v4().as_bytes();
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}
