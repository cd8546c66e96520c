use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::message::{message_type, ToClient};

#[async_trait]
pub trait Serialize: Sized {
    type Error;

    /// Serialize a structure into a writer
    async fn serialize<W: AsyncWriteExt + Unpin + Send>(
        &self,
        writer: &mut W,
    ) -> Result<(), Self::Error>;
}

#[derive(thiserror::Error, Debug)]
pub enum SerializeError {
    #[error("The input is too long!")]
    TooLong,

    #[error("{0}")]
    Io(#[from] tokio::io::Error),
}

#[async_trait]
impl Serialize for &str {
    type Error = SerializeError;

    async fn serialize<W: AsyncWriteExt + Unpin + Send>(
        &self,
        writer: &mut W,
    ) -> Result<(), Self::Error> {
        let length: u8 = self.len().try_into().map_err(|_| SerializeError::TooLong)?;

        writer.write_u8(length).await?;
        writer.write_all(self.as_bytes()).await?;

        Ok(())
    }
}

#[async_trait]
impl Serialize for ToClient {
    type Error = SerializeError;

    async fn serialize<W: AsyncWriteExt + Unpin + Send>(
        &self,
        writer: &mut W,
    ) -> Result<(), <Self as Serialize>::Error> {
        match self {
            ToClient::Heartbeat => writer.write_u8(message_type::HEARTBEAT).await?,
            ToClient::Error { msg } => {
                writer.write_u8(message_type::ERROR).await?;
                msg.as_str().serialize(writer).await?;
            }
            ToClient::Ticket {
                plate,
                road,
                mile1,
                timestamp1,
                mile2,
                timestamp2,
                speed,
            } => {
                writer.write_u8(message_type::TICKET).await?;
                plate.as_str().serialize(writer).await?;
                writer.write_u16(*road).await?;
                writer.write_u16(*mile1).await?;
                writer.write_u32(*timestamp1).await?;
                writer.write_u16(*mile2).await?;
                writer.write_u32(*timestamp2).await?;
                writer.write_u16(*speed).await?;
            }
        };

        Ok(())
    }
}
