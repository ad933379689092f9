//! Executes parsed commands against a running client.

use std::sync::Arc;

use anyhow::Result;
use natter_core::{Envelope, LoginMsg, MessageType};
use natter_services::{Context, FileTransfer, Outbound};

use super::{tip, Command, COMMANDS};

pub enum Flow {
    Continue,
    Exit,
}

pub struct Runner {
    pub outbound: Outbound,
    pub transfers: Arc<FileTransfer>,
    pub ctx: Context,
}

impl Runner {
    pub async fn execute(&self, command: Command) -> Result<Flow> {
        match command {
            Command::Login { nickname } => {
                self.send(Envelope::new(MessageType::UserLogin, &LoginMsg { nickname })?)
                    .await?
            }
            Command::Logout => self.send(Envelope::empty(MessageType::UserLogout)).await?,
            Command::UserList => {
                self.send(Envelope::empty(MessageType::GetOnlineUserList))
                    .await?
            }
            Command::Send { text } => {
                self.send(Envelope::new(MessageType::SendMessage, &text)?)
                    .await?
            }
            Command::SendFile {
                local_id,
                remote_id,
                path,
            } => {
                self.transfers
                    .notify_send_file(&local_id, &remote_id, &path)
                    .await?
            }
            Command::Confirm { path } => self.transfers.confirm(&path).await?,
            Command::Reject => self.transfers.reject().await?,
            Command::Help { command: None } => println!("please add a command after help"),
            Command::Help {
                command: Some(name),
            } => match tip(&name) {
                Some(t) => println!("{t}"),
                None => println!("command {name} not found"),
            },
            Command::List { all } => {
                println!("now command list:");
                for (name, t) in COMMANDS {
                    if all {
                        println!("  {name:<10} {t}");
                    } else {
                        println!("  {name}");
                    }
                }
            }
            Command::Exit => {
                self.ctx.close().await;
                println!("exit client success");
                return Ok(Flow::Exit);
            }
        }
        Ok(Flow::Continue)
    }

    async fn send(&self, env: Envelope) -> Result<()> {
        self.outbound.send(env).await?;
        Ok(())
    }
}
