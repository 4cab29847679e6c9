use dotenv::dotenv;
use std::error::Error;
use std::io::{self, Write};
use std::sync::Arc;
use tax_strategy_advisor::llm::GeminiClient;
use tax_strategy_advisor::{
    AdvisorConfig, ChatOptions, ChatSession, JsonFileReportStore, ReportAssistant, ReportStore,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();
    env_logger::init();

    let store = JsonFileReportStore::open("reports.json")?;
    let reports = store.list()?;
    let report = match std::env::args().nth(1) {
        Some(id) => store.get(&id)?,
        None => reports.last().cloned(),
    };
    let Some(report) = report else {
        println!("⚠️  No saved report found. Run the analyze_documents demo first.");
        return Ok(());
    };

    let config = AdvisorConfig::from_env()?;
    let assistant = ReportAssistant::new(Arc::new(GeminiClient::from_env()?), &config);
    let mut session = ChatSession::new(&assistant, &report.result, ChatOptions::from(&config));

    println!("💬 Chatting about \"{}\"", report.name);
    println!("🤖 Ask about your report (type 'quit' to exit).");
    println!("------------------------------------------------------------------");

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let prompt = input.trim();

        if prompt.eq_ignore_ascii_case("quit") || prompt.eq_ignore_ascii_case("exit") {
            break;
        }
        if prompt.is_empty() {
            continue;
        }

        match session.ask(prompt).await {
            Ok(reply) => println!("\n{}\n", reply),
            Err(e) if e.is_retryable() => println!("\n⚠️  {} (try again)\n", e),
            Err(e) => {
                println!("\n❌ {}\n", e);
                break;
            }
        }
    }

    println!("👋 {} turn(s) in this session.", session.history().len());
    Ok(())
}
