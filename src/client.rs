use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin},
    net::{tcp::OwnedWriteHalf, TcpStream},
};
use tracing::{debug, info};

use crate::{cli::ClientArgs, protocol};

const MENU: &str = "1.公聊模式\n2.私聊模式\n3.更新用户名\n0.退出";
const PROMPT_MENU_RANGE: &str = ">>>请输入合法范围内的数字<<<";
const PROMPT_CHAT: &str = ">>>请输入聊天内容，exit退出";
const PROMPT_TARGET: &str = ">>>请输入聊天对象[用户名]，exit退出";
const PROMPT_NAME: &str = ">>>请输入用户名:";

enum ChatMode {
    Public,
    Private,
    Rename,
    Quit,
}

/// Connects to a relay and drives the interactive menu until the user picks
/// `0` or stdin closes. Server output is pumped to the terminal the whole
/// time, interleaved with the prompts.
pub async fn run(args: ClientArgs) -> Result<()> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let (mut read_half, mut writer) = stream.into_split();
    let pump = tokio::spawn(async move {
        let mut stdout = io::stdout();
        if let Err(err) = io::copy(&mut read_half, &mut stdout).await {
            debug!(error = ?err, "server stream closed");
        }
    });

    let mut stdin = BufReader::new(io::stdin());
    menu_loop(&mut stdin, &mut writer).await?;

    if let Err(err) = writer.shutdown().await {
        debug!(error = ?err, "failed to shut down the connection cleanly");
    }
    pump.abort();
    Ok(())
}

async fn menu_loop(stdin: &mut BufReader<Stdin>, writer: &mut OwnedWriteHalf) -> Result<()> {
    loop {
        match prompt_mode(stdin).await? {
            None | Some(ChatMode::Quit) => return Ok(()),
            Some(ChatMode::Public) => public_chat(stdin, writer).await?,
            Some(ChatMode::Private) => private_chat(stdin, writer).await?,
            Some(ChatMode::Rename) => update_name(stdin, writer).await?,
        }
    }
}

/// Renders the menu until the user picks a valid mode. `None` means stdin is
/// gone and the client should exit.
async fn prompt_mode(stdin: &mut BufReader<Stdin>) -> Result<Option<ChatMode>> {
    loop {
        print_line(MENU).await?;
        let Some(choice) = read_input(stdin).await? else {
            return Ok(None);
        };
        match choice.trim() {
            "1" => return Ok(Some(ChatMode::Public)),
            "2" => return Ok(Some(ChatMode::Private)),
            "3" => return Ok(Some(ChatMode::Rename)),
            "0" => return Ok(Some(ChatMode::Quit)),
            _ => print_line(PROMPT_MENU_RANGE).await?,
        }
    }
}

/// Public mode: every non-empty input line is broadcast as-is.
async fn public_chat(stdin: &mut BufReader<Stdin>, writer: &mut OwnedWriteHalf) -> Result<()> {
    loop {
        print_line(PROMPT_CHAT).await?;
        let Some(text) = read_input(stdin).await? else {
            return Ok(());
        };
        if text == "exit" {
            return Ok(());
        }
        if !text.is_empty() {
            protocol::write_line(writer, &text).await?;
        }
    }
}

/// Private mode: shows who is online, then sends `to|<name>|<msg>` lines to
/// the chosen participant until the user backs out.
async fn private_chat(stdin: &mut BufReader<Stdin>, writer: &mut OwnedWriteHalf) -> Result<()> {
    protocol::write_line(writer, "who").await?;
    loop {
        print_line(PROMPT_TARGET).await?;
        let Some(target) = read_input(stdin).await? else {
            return Ok(());
        };
        if target == "exit" {
            return Ok(());
        }
        if target.is_empty() {
            continue;
        }

        loop {
            print_line(PROMPT_CHAT).await?;
            let Some(text) = read_input(stdin).await? else {
                return Ok(());
            };
            if text == "exit" {
                break;
            }
            if !text.is_empty() {
                protocol::write_line(writer, &format!("to|{target}|{text}")).await?;
            }
        }

        // Back at the participant prompt; refresh the listing first.
        protocol::write_line(writer, "who").await?;
    }
}

async fn update_name(stdin: &mut BufReader<Stdin>, writer: &mut OwnedWriteHalf) -> Result<()> {
    print_line(PROMPT_NAME).await?;
    let Some(name) = read_input(stdin).await? else {
        return Ok(());
    };
    if !name.is_empty() {
        protocol::write_line(writer, &format!("rename|{name}")).await?;
    }
    Ok(())
}

/// Reads one line of user input, `None` once stdin closes.
async fn read_input(stdin: &mut BufReader<Stdin>) -> Result<Option<String>> {
    let mut line = String::new();
    let bytes = stdin.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
}

async fn print_line(text: &str) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(text.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
