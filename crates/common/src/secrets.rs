use rand::distr::{
    Alphanumeric,
    SampleString,
};

pub const DELETE_TOKEN_LEN: usize = 12;

/// Random alphanumeric secret, eg a delete token. Not memorable on purpose.
pub fn generate_token(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::rng(), len)
}

pub fn generate_delete_token() -> String {
    generate_token(DELETE_TOKEN_LEN)
}

#[cfg(test)]
mod tests {
    use super::{
        generate_delete_token,
        DELETE_TOKEN_LEN,
    };

    #[test]
    fn test_delete_token_shape() {
        let t = generate_delete_token();
        assert_eq!(t.len(), DELETE_TOKEN_LEN);
        assert!(t.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(generate_delete_token(), generate_delete_token());
    }
}
