/**********************************************************************

Copyright (C) 2021 by reddal

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

**********************************************************************/


use aes::Aes128;
use cfb_mode::{
	cipher::{generic_array::GenericArray, AsyncStreamCipher, NewCipher},
	Cfb,
};
use md5::{Digest, Md5};

type Aes128Cfb = Cfb<Aes128>;

pub const KEY_LEN: usize = 16;

/// AES-128-CFB cipher for frame bodies.
///
/// Every call starts from a fresh cipher state, so frames can be
/// decrypted independently of each other.
#[derive(Clone)]
pub struct FrameCipher {
	key: [u8; KEY_LEN],
	iv: [u8; KEY_LEN],
}

impl FrameCipher {
	/// Derives key and IV from `secret`.
	///
	/// Returns `None` if `secret` is empty, which means no encryption.
	#[must_use]
	pub fn new(secret: &str) -> Option<Self> {
		if secret.is_empty() {
			return None;
		}
		let key: [u8; KEY_LEN] = Md5::digest(secret.as_bytes()).into();
		let iv: [u8; KEY_LEN] = {
			let mut hasher = Md5::new();
			hasher.update(key);
			hasher.update(secret.as_bytes());
			hasher.finalize().into()
		};
		Some(Self { key, iv })
	}

	pub fn encrypt(&self, buf: &mut [u8]) {
		self.new_cipher().encrypt(buf);
	}

	pub fn decrypt(&self, buf: &mut [u8]) {
		self.new_cipher().decrypt(buf);
	}

	fn new_cipher(&self) -> Aes128Cfb {
		Aes128Cfb::new(
			GenericArray::from_slice(&self.key),
			GenericArray::from_slice(&self.iv),
		)
	}
}

impl std::fmt::Debug for FrameCipher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("FrameCipher(aes-128-cfb)")
	}
}
