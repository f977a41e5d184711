//! Flip payload confidentiality. Each gateway generates an RSA keypair at
//! `register_gateway`; `encrypt_connection` encrypts `type_info` and
//! `transport_uri` to a remote gateway's public key, `name`, `node` and
//! `type` remain in clear so the receiver can key by rule before it is able
//! to decrypt anything.

use openssl::pkey::{Private, Public};
use openssl::rsa::{Padding, Rsa};
use serde::{Deserialize, Serialize};

use crate::connection::Connection;
use crate::error::GatewayError;

const RSA_KEY_BITS: u32 = 2048;

pub struct Keypair {
    private: Rsa<Private>,
}

impl Keypair {
    pub fn generate() -> Result<Self, GatewayError> {
        let private = Rsa::generate(RSA_KEY_BITS).map_err(|e| GatewayError::LocalAdapterError {
            detail: format!("RSA keypair generation failed: {e}"),
        })?;
        Ok(Keypair { private })
    }

    /// PEM-encoded public key, as stored under `rocon:<gateway>:public_key`.
    pub fn public_key_pem(&self) -> Result<Vec<u8>, GatewayError> {
        self.private
            .public_key_to_pem()
            .map_err(|e| GatewayError::LocalAdapterError {
                detail: format!("failed to serialize public key: {e}"),
            })
    }

    pub fn public_key(&self) -> Result<PublicKey, GatewayError> {
        let pem = self.public_key_pem()?;
        PublicKey::from_pem(&pem)
    }

    fn private_rsa(&self) -> &Rsa<Private> {
        &self.private
    }
}

/// A remote gateway's public key, as read from the hub.
#[derive(Clone)]
pub struct PublicKey {
    rsa: Rsa<Public>,
}

impl PublicKey {
    pub fn from_pem(pem: &[u8]) -> Result<Self, GatewayError> {
        let rsa = Rsa::public_key_from_pem(pem).map_err(|e| GatewayError::LocalAdapterError {
            detail: format!("failed to parse public key: {e}"),
        })?;
        Ok(PublicKey { rsa })
    }

    pub fn to_pem(&self) -> Result<Vec<u8>, GatewayError> {
        self.rsa
            .public_key_to_pem()
            .map_err(|e| GatewayError::LocalAdapterError {
                detail: format!("failed to serialize public key: {e}"),
            })
    }

    fn encrypt_field(&self, plaintext: &str) -> Result<Vec<u8>, GatewayError> {
        let mut buf = vec![0u8; self.rsa.size() as usize];
        let len = self
            .rsa
            .public_encrypt(plaintext.as_bytes(), &mut buf, Padding::PKCS1)
            .map_err(|e| GatewayError::LocalAdapterError {
                detail: format!("RSA encrypt failed: {e}"),
            })?;
        buf.truncate(len);
        Ok(buf)
    }
}

/// A Connection whose `type_info`/`transport_uri` fields have been replaced
/// by their RSA-encrypted ciphertext. `type` and `name` remain in clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedConnection {
    pub kind: crate::connection::ConnectionType,
    pub name: String,
    pub node_uri: String,
    pub encrypted_type_info: Vec<u8>,
    pub encrypted_transport_uri: Vec<u8>,
}

impl EncryptedConnection {
    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).expect("tuple encoding of EncryptedConnection never fails")
    }

    pub fn from_wire(s: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(s).map_err(|e| GatewayError::ConnectionTypeError {
            found: format!("malformed encrypted connection on wire: {e}"),
        })
    }
}

pub fn encrypt_connection(connection: &Connection, public_key: &PublicKey) -> Result<EncryptedConnection, GatewayError> {
    Ok(EncryptedConnection {
        kind: connection.kind,
        name: connection.name.clone(),
        node_uri: connection.node_uri.clone(),
        encrypted_type_info: public_key.encrypt_field(&connection.type_info)?,
        encrypted_transport_uri: public_key.encrypt_field(&connection.transport_uri)?,
    })
}

pub fn decrypt_connection(encrypted: &EncryptedConnection, keypair: &Keypair) -> Result<Connection, GatewayError> {
    let rsa = keypair.private_rsa();
    let mut type_info_buf = vec![0u8; rsa.size() as usize];
    let type_info_len = rsa
        .private_decrypt(&encrypted.encrypted_type_info, &mut type_info_buf, Padding::PKCS1)
        .map_err(|e| GatewayError::LocalAdapterError {
            detail: format!("RSA decrypt of type_info failed: {e}"),
        })?;
    type_info_buf.truncate(type_info_len);

    let mut transport_uri_buf = vec![0u8; rsa.size() as usize];
    let transport_uri_len = rsa
        .private_decrypt(
            &encrypted.encrypted_transport_uri,
            &mut transport_uri_buf,
            Padding::PKCS1,
        )
        .map_err(|e| GatewayError::LocalAdapterError {
            detail: format!("RSA decrypt of transport_uri failed: {e}"),
        })?;
    transport_uri_buf.truncate(transport_uri_len);

    Ok(Connection {
        kind: encrypted.kind,
        name: encrypted.name.clone(),
        node_uri: encrypted.node_uri.clone(),
        type_info: String::from_utf8(type_info_buf).map_err(|e| GatewayError::LocalAdapterError {
            detail: format!("decrypted type_info was not utf8: {e}"),
        })?,
        transport_uri: String::from_utf8(transport_uri_buf).map_err(|e| GatewayError::LocalAdapterError {
            detail: format!("decrypted transport_uri was not utf8: {e}"),
        })?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionType;

    #[test]
    fn round_trips_through_the_owning_keypair() {
        let keypair = Keypair::generate().unwrap();
        let public = keypair.public_key().unwrap();
        let conn = Connection::new(
            ConnectionType::Service,
            "/add",
            "/talker/node",
            "rocon_msgs/Add",
            "rosrpc://host:9999",
        );
        let encrypted = encrypt_connection(&conn, &public).unwrap();
        assert_eq!(encrypted.name, conn.name);
        assert_ne!(encrypted.encrypted_type_info, conn.type_info.as_bytes());

        let decrypted = decrypt_connection(&encrypted, &keypair).unwrap();
        assert_eq!(decrypted, conn);
    }

    #[test]
    fn decrypting_with_a_foreign_keypair_fails() {
        let owner = Keypair::generate().unwrap();
        let other = Keypair::generate().unwrap();
        let public = owner.public_key().unwrap();
        let conn = Connection::new(ConnectionType::Publisher, "/chatter", "/n", "std_msgs/String", "tcp://h:1");
        let encrypted = encrypt_connection(&conn, &public).unwrap();
        assert!(decrypt_connection(&encrypted, &other).is_err());
    }
}
