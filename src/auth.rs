// MIT License
//
// Copyright (c) 2019-2021 Tobias Pfeiffer
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use crate::{common::*, pool::Connection};

#[cfg(feature = "auth")]
use {
	bson::{doc, Binary, spec::BinarySubtype},
	hmac::{Hmac, Mac},
	sha2::{Sha256, Digest},
	rand::Rng,
	log::debug
};

#[cfg(feature = "auth")]
const MIN_SCRAM_ITERATIONS: usize = 4096;

/// Logs `connection` into `database`. Failures other than transport errors
/// are reported as `Error::Auth`.
#[cfg(feature = "auth")]
pub(crate) fn authenticate(
	connection:  &mut Connection,
	database:    &str,
	credentials: &Credentials
) -> Result<()> {
	debug!("authenticating connection {} as `{}` on `{}` using {}",
		connection.id(), credentials.username(), database, credentials.mechanism());

	let result = match credentials.mechanism() {
		AuthMechanism::MongoDbCr   => auth_mongodb_cr(connection, database, credentials),
		AuthMechanism::ScramSha256 => auth_scram(connection, database, credentials)
	};

	result.map_err(|e| match e {
		e if e.is_transport_error() => e,
		e @ Error::Auth { .. } => e,
		e => Error::Auth { database: database.to_string(), reason: e.to_string() }
	})
}

#[cfg(not(feature = "auth"))]
pub(crate) fn authenticate(
	_connection:  &mut Connection,
	database:     &str,
	_credentials: &Credentials
) -> Result<()> {
	Err(Error::Auth {
		database: database.to_string(),
		reason:   "authentication support was not compiled in".to_string()
	})
}

/// `md5(nonce + username + md5(username + ":mongo:" + password))`, hex encoded.
#[cfg(feature = "auth")]
pub(crate) fn mongodb_cr_key(nonce: &str, username: &str, password: &str) -> String {
	let digest = md5::compute(format!("{}:mongo:{}", username, password));
	format!("{:x}", md5::compute(format!("{}{}{:x}", nonce, username, digest)))
}

#[cfg(feature = "auth")]
fn auth_mongodb_cr(connection: &mut Connection, database: &str, credentials: &Credentials) -> Result<()> {
	let reply = connection.run_command(database, doc! { "getnonce": 1 })?;
	let nonce = reply.get_str("nonce")?;
	let key = mongodb_cr_key(nonce, credentials.username(), credentials.password());

	connection.run_command(database, doc! {
		"authenticate": 1,
		"user":         credentials.username(),
		"nonce":        nonce,
		"key":          key
	})?;

	Ok(())
}

#[cfg(feature = "auth")]
fn fail(database: &str, reason: &str) -> Error {
	Error::Auth { database: database.to_string(), reason: reason.to_string() }
}

/// Value of `key=` in a comma separated SCRAM message.
#[cfg(feature = "auth")]
fn attribute(message: &str, key: char) -> Option<&str> {
	message.split(',')
		.find(|s| s.len() >= 2 && s.starts_with(key) && s[1..].starts_with('='))
		.map(|s| &s[2..])
}

#[cfg(feature = "auth")]
fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
	let mut mac = Hmac::<Sha256>::new_varkey(key)
		.map_err(|_| Error::Invariant("invalid hmac key length"))?;
	mac.input(data);
	Ok(mac.result().code().to_vec())
}

#[cfg(feature = "auth")]
struct ScramFinal {
	message:          String,
	server_signature: Vec<u8>
}

/// Computes the client final message for `server_first`.
#[cfg(feature = "auth")]
fn scram_client_final(
	database:          &str,
	password:          &str,
	client_nonce:      &str,
	client_first_bare: &str,
	server_first:      &str
) -> Result<ScramFinal> {
	let nonce = attribute(server_first, 'r').ok_or_else(|| fail(database, "server nonce missing"))?;
	let salt = attribute(server_first, 's')
		.and_then(|s| base64::decode(s).ok())
		.ok_or_else(|| fail(database, "salt missing or malformed"))?;
	let iterations = attribute(server_first, 'i')
		.and_then(|s| s.parse::<usize>().ok())
		.ok_or_else(|| fail(database, "iteration count missing or malformed"))?;

	if !nonce.starts_with(client_nonce) {
		return Err(fail(database, "server nonce does not extend the client nonce"));
	}

	if iterations < MIN_SCRAM_ITERATIONS {
		return Err(fail(database, "iteration count is too low"));
	}

	// TODO SASLprep the password before deriving the key
	let mut salted_password = [0u8; 32];
	pbkdf2::pbkdf2::<Hmac<Sha256>>(password.as_bytes(), &salt, iterations, &mut salted_password);

	let client_key = hmac(&salted_password, b"Client Key")?;
	let server_key = hmac(&salted_password, b"Server Key")?;
	let stored_key = Sha256::digest(&client_key);

	let without_proof = format!("c=biws,r={}", nonce);
	let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
	let client_signature = hmac(&stored_key, auth_message.as_bytes())?;
	let client_proof = client_key.iter()
		.zip(client_signature.iter())
		.map(|(k, s)| k ^ s)
		.collect::<Vec<_>>();

	Ok(ScramFinal {
		message:          format!("{},p={}", without_proof, base64::encode(&client_proof)),
		server_signature: hmac(&server_key, auth_message.as_bytes())?
	})
}

#[cfg(feature = "auth")]
fn binary(bytes: &[u8]) -> Binary {
	Binary { subtype: BinarySubtype::Generic, bytes: bytes.to_vec() }
}

#[cfg(feature = "auth")]
fn sasl_payload(database: &str, reply: &bson::Document) -> Result<String> {
	let payload = reply.get_binary_generic("payload")?;
	String::from_utf8(payload.clone()).map_err(|_| fail(database, "sasl payload is not utf-8"))
}

#[cfg(feature = "auth")]
fn auth_scram(connection: &mut Connection, database: &str, credentials: &Credentials) -> Result<()> {
	let mut rng = rand::thread_rng();
	let client_nonce = (0..32)
		.map(|_| rng.gen_range(0x2Du8, 0x7Fu8) as char)
		.collect::<String>();

	let username = credentials.username().replace('=', "=3D").replace(',', "=2C");
	let client_first_bare = format!("n={},r={}", username, client_nonce);

	let reply = connection.run_command(database, doc! {
		"saslStart":     1,
		"mechanism":     AuthMechanism::ScramSha256.as_str(),
		"payload":       binary(format!("n,,{}", client_first_bare).as_bytes()),
		"autoAuthorize": 1
	})?;

	let conversation_id = reply.get_i32("conversationId")?;
	let server_first = sasl_payload(database, &reply)?;
	let client_final = scram_client_final(
		database,
		credentials.password(),
		&client_nonce,
		&client_first_bare,
		&server_first
	)?;

	let reply = connection.run_command(database, doc! {
		"saslContinue":   1,
		"conversationId": conversation_id,
		"payload":        binary(client_final.message.as_bytes())
	})?;

	let server_final = sasl_payload(database, &reply)?;
	let verifier = attribute(&server_final, 'v')
		.and_then(|v| base64::decode(v).ok())
		.ok_or_else(|| fail(database, "server signature missing"))?;

	if verifier != client_final.server_signature {
		return Err(fail(database, "server signature does not match"));
	}

	// some servers want an empty round trip before reporting done
	if !reply.get_bool("done").unwrap_or(false) {
		let reply = connection.run_command(database, doc! {
			"saslContinue":   1,
			"conversationId": conversation_id,
			"payload":        binary(&[])
		})?;

		if !reply.get_bool("done").unwrap_or(false) {
			return Err(fail(database, "sasl conversation did not complete"));
		}
	}

	Ok(())
}
