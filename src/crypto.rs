// 统一认证的密码加密
// 服务端给出十六进制的模数和指数, 客户端做不带填充的 RSA: c = m^e mod n
use crate::models::FetchError;

use num_bigint::BigUint;
use serde::Deserialize;

// getPubKey 接口返回的公钥
#[derive(Debug, Clone, Deserialize)]
pub struct PublicKey {
    pub modulus: String,
    pub exponent: String
}

impl PublicKey {
    /// 加密密码, 结果为小写十六进制, 左侧补 0 到模数的十六进制长度
    pub fn encrypt(&self, password: &str) -> Result<String, FetchError> {
        encrypt_password(password, &self.exponent, &self.modulus)
    }
}

fn parse_hex(name: &str, hex: &str) -> Result<BigUint, FetchError> {
    BigUint::parse_bytes(hex.trim().as_bytes(), 16)
        .ok_or_else(|| FetchError::ParseError(format!("公钥{}不是合法的十六进制: {}", name, hex)))
}

pub fn encrypt_password(password: &str, exponent_hex: &str, modulus_hex: &str) -> Result<String, FetchError> {
    let exponent = parse_hex("指数", exponent_hex)?;
    let modulus = parse_hex("模数", modulus_hex)?;
    if modulus.bits() == 0 {
        return Err(FetchError::ParseError("公钥模数为 0".to_string()))
    }

    let message = BigUint::from_bytes_be(password.as_bytes());
    let cipher = message.modpow(&exponent, &modulus);

    let width = modulus_hex.trim().trim_start_matches('0').len();
    Ok(format!("{:0>width$}", cipher.to_str_radix(16), width = width))
}
