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


use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use std::{
	convert::TryFrom,
	io::{self, Read, Write},
};

/// Compresses `data` with zlib.
///
/// # Errors
///
/// Returns an error if the encoder fails.
pub fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
	let mut enc = ZlibEncoder::new(Vec::with_capacity(data.len()), Compression::default());
	enc.write_all(data)?;
	enc.finish()
}

/// Decompresses zlib `data`, refusing output larger than `limit` bytes.
///
/// # Errors
///
/// Returns an error if `data` is not valid zlib or inflates past `limit`.
pub fn decompress(data: &[u8], limit: usize) -> io::Result<Vec<u8>> {
	let mut out = Vec::with_capacity(data.len() * 2);
	let limit_plus_one = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
	ZlibDecoder::new(data)
		.take(limit_plus_one)
		.read_to_end(&mut out)?;
	if out.len() > limit {
		return Err(io::Error::new(
			io::ErrorKind::InvalidData,
			format!("decompressed data exceeds {} bytes", limit),
		));
	}
	Ok(out)
}
