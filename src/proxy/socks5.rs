//! SOCKS5 client handshake (RFC 1928, RFC 1929).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::address::Address;
use crate::error::{Error, Result};

pub const SOCKS_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USER_PASS: u8 = 0x02;
pub const USER_PASS_VERSION: u8 = 0x01;
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// Greeting: version 5, two methods offered (no auth, username/password).
const GREETING: [u8; 4] = [SOCKS_VERSION, 0x02, METHOD_NO_AUTH, METHOD_USER_PASS];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    UdpAssociate,
}

impl Command {
    fn code(&self) -> u8 {
        match self {
            Command::Connect => CMD_CONNECT,
            Command::UdpAssociate => CMD_UDP_ASSOCIATE,
        }
    }
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply code",
    }
}

/// Run method negotiation, optional authentication and `cmd` against
/// `target`. Returns the bound address from the server reply.
pub async fn handshake<S>(
    stream: &mut S,
    proxy: &Address,
    target: &Address,
    cmd: Command,
) -> Result<Address>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&GREETING).await?;

    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    match method[1] {
        METHOD_NO_AUTH => {}
        METHOD_USER_PASS => authenticate(stream, proxy).await?,
        other => {
            return Err(Error::Socks5Auth(format!(
                "server selected unsupported method {:#04x}",
                other
            )));
        }
    }

    let mut request = vec![SOCKS_VERSION, cmd.code(), 0x00];
    target.encode_socks5(&mut request)?;
    stream.write_all(&request).await?;

    let mut reply = [0u8; 3];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(Error::socks5(format!(
            "{} ({:#04x}) for {}",
            reply_message(reply[1]),
            reply[1],
            target
        )));
    }
    Address::read_socks5(stream).await
}

async fn authenticate<S>(stream: &mut S, proxy: &Address) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user = proxy
        .user()
        .ok_or_else(|| Error::Socks5Auth("proxy requires credentials".into()))?;
    let pass = proxy.password().unwrap_or("");
    let ulen = u8::try_from(user.len())
        .map_err(|_| Error::Socks5Auth("username longer than 255 bytes".into()))?;
    let plen = u8::try_from(pass.len())
        .map_err(|_| Error::Socks5Auth("password longer than 255 bytes".into()))?;

    let mut msg = Vec::with_capacity(3 + user.len() + pass.len());
    msg.push(USER_PASS_VERSION);
    msg.push(ulen);
    msg.extend_from_slice(user.as_bytes());
    msg.push(plen);
    msg.extend_from_slice(pass.as_bytes());
    stream.write_all(&msg).await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[1] != 0x00 {
        return Err(Error::Socks5Auth(format!(
            "credentials rejected (status {:#04x})",
            status[1]
        )));
    }
    Ok(())
}
