use std::io::Write;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};

use vocabook_core_sdk::{
    config::AppConfig,
    db,
    detail::{self, DetailSource},
    llm::{ChatClient, GPT_MODELS},
    review::{self, ReviewSheet},
    server,
    settings::{self, SettingKey, Settings},
    telemetry,
    vocabulary::VocabularyBook,
};

/**
 * \brief CLI 程序入口：生词本、单词讲解与复习练习。
 */
#[derive(Parser, Debug)]
#[command(name = "vocabook", version, about = "Vocabulary book with AI explanations and reviews")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 查看或修改设置。
     */
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /**
     * \brief 录入单词，默认随后流式生成讲解。
     */
    Add {
        word: String,
        #[arg(long, default_value_t = false)]
        no_detail: bool,
    },

    /**
     * \brief 列出生词，最近录入在前。
     */
    List,

    /**
     * \brief 显示单词讲解，未缓存时流式生成。
     */
    Show { word: String },

    Delete { word: String },

    /**
     * \brief 针对单词提问，讲解作为上下文。
     */
    Ask { word: String, question: String },

    /**
     * \brief 生成新的复习练习。
     */
    Review {
        #[arg(long, default_value_t = false)]
        show_answers: bool,
    },

    /**
     * \brief 显示最近一次复习练习。
     */
    LastReview {
        #[arg(long, default_value_t = false)]
        show_answers: bool,
    },

    /**
     * \brief 列出历史复习练习，最新在前。
     */
    Reviews,

    /**
     * \brief 启动本地 HTTP 服务并提供前端页面。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /** \brief 保存 OpenAI API Key */
    SetKey { key: String },
    /** \brief 选择模型，不在列表中的模型按默认模型使用 */
    SetModel { model: String },
    Show,
    /** \brief 开关本地遥测日志 */
    Telemetry {
        #[arg(action = ArgAction::Set)]
        enabled: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env();
    telemetry::set_log_dir(&config.log_dir);

    let conn = db::open_db(&config.db_path).context("open database failed")?;
    db::migrate(&conn).context("apply migrations failed")?;
    let telemetry_enabled = db::get_telemetry_enabled(&conn).unwrap_or(false);
    telemetry::set_enabled(telemetry_enabled);
    let settings = Settings::load(&conn).context("load settings failed")?;

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::SetKey { key } => {
                let next =
                    settings::store_setting(&conn, &settings, SettingKey::OpenaiApiKey, &key)
                        .context("save api key failed")?;
                println!("Saved API key {}", next.masked_api_key());
            }
            ConfigAction::SetModel { model } => {
                let next =
                    settings::store_setting(&conn, &settings, SettingKey::OpenaiModel, &model)
                        .context("save model failed")?;
                if next.model() != next.openai_model {
                    println!(
                        "Saved model \"{}\" (not supported, {} will be used)",
                        next.openai_model,
                        next.model()
                    );
                } else {
                    println!("Saved model {}", next.model());
                }
            }
            ConfigAction::Show => {
                let key = if settings.has_api_key() {
                    settings.masked_api_key()
                } else {
                    "(not set)".to_string()
                };
                println!("database:   {}", config.db_path.display());
                println!("api base:   {}", config.api_base);
                println!("api key:    {}", key);
                println!("model:      {}", settings.model());
                println!("models:     {}", GPT_MODELS.join(", "));
                println!(
                    "telemetry:  {} ({})",
                    if telemetry_enabled { "on" } else { "off" },
                    telemetry::log_path().display()
                );
            }
            ConfigAction::Telemetry { enabled } => {
                db::set_telemetry_enabled(&conn, enabled).context("save telemetry failed")?;
                telemetry::set_enabled(enabled);
                println!("Telemetry {}", if enabled { "enabled" } else { "disabled" });
            }
        },
        Commands::Add { word, no_detail } => {
            let mut book = VocabularyBook::load(conn).context("load vocabulary failed")?;
            let added = book.add_word(&word)?;
            if added.created {
                println!("Added \"{}\" (id={})", added.item.word, added.item.id);
            } else {
                println!("\"{}\" is already in the book, moved to the top", added.item.word);
            }
            if no_detail {
                return Ok(());
            }
            if !settings.has_api_key() {
                println!("Detail skipped: no API key, run `vocabook config set-key <KEY>`");
                return Ok(());
            }
            let client = client(&settings, &config)?;
            print_detail(&client, &settings, &mut book, added.item.id).await?;
        }
        Commands::List => {
            let book = VocabularyBook::load(conn).context("load vocabulary failed")?;
            if book.is_empty() {
                println!("No words yet, add one with `vocabook add <word>`");
            }
            for item in book.sorted_by_recent() {
                println!(
                    "{:>5}  {:<24} reviewed {}x{}",
                    item.id,
                    item.word,
                    item.review_count,
                    if item.detail.is_some() { "  [detail]" } else { "" }
                );
            }
        }
        Commands::Show { word } => {
            let mut book = VocabularyBook::load(conn).context("load vocabulary failed")?;
            let id = find_id(&book, &word)?;
            let cached = book
                .get(id)
                .and_then(|item| item.detail.as_deref())
                .filter(|text| !text.is_empty());
            if let Some(text) = cached {
                println!("{}", text);
                return Ok(());
            }
            let client = client(&settings, &config)?;
            print_detail(&client, &settings, &mut book, id).await?;
        }
        Commands::Delete { word } => {
            let mut book = VocabularyBook::load(conn).context("load vocabulary failed")?;
            let id = find_id(&book, &word)?;
            book.delete(id)?;
            println!("Deleted \"{}\"", word.trim());
        }
        Commands::Ask { word, question } => {
            let book = VocabularyBook::load(conn).context("load vocabulary failed")?;
            let id = find_id(&book, &word)?;
            let client = client(&settings, &config)?;
            detail::ask_about_word(&client, settings.model(), &book, id, &question, print_delta)
                .await?;
            println!();
        }
        Commands::Review { show_answers } => {
            let mut book = VocabularyBook::load(conn).context("load vocabulary failed")?;
            let client = client(&settings, &config)?;
            let record = if show_answers {
                review::generate_review(&client, settings.model(), &mut book, print_delta).await?
            } else {
                // 答案段不直接打印，结束后按需渲染
                let record =
                    review::generate_review(&client, settings.model(), &mut book, |_| {}).await?;
                print!("{}", ReviewSheet::parse(&record.content).render(false));
                record
            };
            println!();
            let words: Vec<&str> = record
                .vocabulary_ids
                .iter()
                .filter_map(|id| book.get(*id).map(|item| item.word.as_str()))
                .collect();
            println!("\nReviewed: {}", words.join(", "));
        }
        Commands::LastReview { show_answers } => match review::latest_review(&conn)? {
            Some(record) => {
                println!("{}", ReviewSheet::parse(&record.content).render(show_answers));
            }
            None => println!("No review yet, generate one with `vocabook review`"),
        },
        Commands::Reviews => {
            let history = review::review_history(&conn)?;
            if history.is_empty() {
                println!("No review yet, generate one with `vocabook review`");
            }
            for record in history {
                let title = ReviewSheet::parse(&record.content)
                    .exercise
                    .lines()
                    .map(str::trim)
                    .find(|line| !line.is_empty())
                    .unwrap_or("");
                println!(
                    "{:>5}  {}  {} words  {}",
                    record.id,
                    record.timestamp.date(),
                    record.vocabulary_ids.len(),
                    title
                );
            }
        }
        Commands::Serve { addr } => {
            drop(conn);
            server::run(&addr, config).await?;
        }
    }

    Ok(())
}

fn client(settings: &Settings, config: &AppConfig) -> Result<ChatClient> {
    ChatClient::from_settings(settings, config)
        .context("run `vocabook config set-key <KEY>` first")
}

fn find_id(book: &VocabularyBook, word: &str) -> Result<i64> {
    book.find_word(word)
        .map(|item| item.id)
        .with_context(|| format!("\"{}\" is not in the vocabulary book", word.trim()))
}

fn print_delta(delta: &str) {
    print!("{}", delta);
    std::io::stdout().flush().ok();
}

async fn print_detail(
    client: &ChatClient,
    settings: &Settings,
    book: &mut VocabularyBook,
    id: i64,
) -> Result<()> {
    let found = detail::explain_word(client, settings.model(), book, id, print_delta).await?;
    if found.source == DetailSource::Cached {
        print!("{}", found.text);
    }
    println!();
    Ok(())
}
