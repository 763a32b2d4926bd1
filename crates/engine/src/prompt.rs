#![forbid(unsafe_code)]

//! Deterministic prompt assembly. Builders are pure functions of their
//! inputs so a prompt can be reproduced byte-for-byte for tests and for
//! the batch-input path.

use pb_core::book::{Role, TranslationPair};
use pb_core::split::split_sentences;
use regex::Regex;
use serde_json::{Map, Value, json};
use std::sync::OnceLock;

fn quotation_mark_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\p{Quotation_Mark}").expect("static mark pattern"))
}

#[derive(Clone, Debug)]
pub struct TranslationPromptInput<'a> {
    pub book_title: &'a str,
    pub role: Role,
    pub source_text: &'a str,
    pub hint: &'a str,
    pub prev_context: &'a [String],
    pub next_context: &'a [String],
    pub extra_hint: &'a str,
    pub attempt: u32,
    pub jsonize_input: bool,
}

/// The en→ja translation prompt. `attempt` escalates the guidance:
/// retry diagnostics from attempt 2, pre-split source and a worked
/// example from attempt 3. `jsonize_input` switches the context block
/// between a JSON object and a bulleted list so the retry ladder can
/// change representation.
pub fn build_translation_prompt(input: &TranslationPromptInput<'_>) -> String {
    let mut lines: Vec<String> = Vec::new();
    if input.book_title.is_empty() {
        lines.push("あなたは書籍の英日翻訳を担当しています。".to_string());
    } else {
        lines.push(format!(
            "あなたは『{}』の英日翻訳を担当しています。",
            input.book_title
        ));
    }
    lines.push("以下の情報をもとに、与えられたパラグラフを自然な日本語に翻訳してください。".to_string());
    lines.push("----".to_string());
    if input.jsonize_input {
        let mut data = Map::new();
        if !input.hint.is_empty() {
            data.insert("現在の場面の要約".to_string(), json!(input.hint));
        }
        if !input.prev_context.is_empty() {
            data.insert("直前のパラグラフ".to_string(), json!(input.prev_context));
        }
        if !input.next_context.is_empty() {
            data.insert("直後のパラグラフ".to_string(), json!(input.next_context));
        }
        data.insert("翻訳対象のパラグラフ".to_string(), json!(input.source_text));
        lines.push(
            serde_json::to_string_pretty(&Value::Object(data))
                .unwrap_or_else(|_| input.source_text.to_string()),
        );
        lines.push(String::new());
    } else {
        if !input.hint.is_empty() {
            lines.push("現在の場面の要約（前回出力された文脈ヒント）:".to_string());
            lines.push(format!("- {}", input.hint));
            lines.push(String::new());
        }
        if !input.prev_context.is_empty() {
            lines.push("直前のパラグラフ:".to_string());
            for sentence in input.prev_context {
                lines.push(format!(" - {sentence}"));
            }
            lines.push(String::new());
        }
        if !input.next_context.is_empty() {
            lines.push("直後のパラグラフ:".to_string());
            for sentence in input.next_context {
                lines.push(format!(" - {sentence}"));
            }
            lines.push(String::new());
        }
        lines.push("----".to_string());
        lines.push("翻訳対象のパラグラフ:".to_string());
        if input.attempt >= 3 {
            lines.push(split_sentences(input.source_text).join("\n"));
        } else {
            lines.push(input.source_text.to_string());
        }
    }
    lines.push(String::new());
    lines.push("----".to_string());
    lines.push("出力形式はJSONとし、次の要素を含めてください:".to_string());
    lines.push("{".to_string());
    lines.push("  \"translations\": [".to_string());
    let splits_sentences = matches!(input.role, Role::Paragraph | Role::Blockquote);
    if splits_sentences {
        lines.push("    { \"en\": \"原文の文1\", \"ja\": \"対応する訳文1\" },".to_string());
        lines.push("    { \"en\": \"原文の文2\", \"ja\": \"対応する訳文2\" }".to_string());
        lines.push("    // ...".to_string());
    } else {
        lines.push("    { \"en\": \"原文の文\", \"ja\": \"対応する訳文\" }".to_string());
    }
    lines.push("  ],".to_string());
    lines.push("  \"context_hint\": \"この段落を含めた現在の場面の要約、登場人物、心情、場の変化などを1文（100トークン程度）で簡潔に記述してください。\",".to_string());
    lines.push("}".to_string());
    lines.push(String::new());
    lines.push("----".to_string());
    if input.attempt >= 3 {
        lines.push("例を示します:".to_string());
        lines.push("{".to_string());
        lines.push("  \"translations\": [".to_string());
        if splits_sentences {
            lines.push("    { \"en\": \"He said, “Hello, world!”\", \"ja\": \"「こんにちは世界！」と彼は言った。\" },".to_string());
            lines.push("    { \"en\": \"“Good-bye, world”, I replied.\", \"ja\": \"「さよなら世界」と私は応えた。\" }".to_string());
            lines.push("    // ...".to_string());
        } else {
            lines.push("    { \"en\": \"He said, “Hello, world!”\", \"ja\": \"「こんにちは世界！」と彼は言った。\" }".to_string());
        }
        lines.push("  ],".to_string());
        lines.push("  \"context_hint\": \"ジョーが言ったことと反対のことをナンシーが言うやり取りをしている。\",".to_string());
        lines.push("}".to_string());
        lines.push(String::new());
        lines.push("----".to_string());
    }
    match input.role {
        Role::BookTitle => {
            lines.push("このパラグラフは本の題名です。".to_string());
        }
        Role::ChapterTitle => {
            lines.push("このパラグラフは章の題名です。".to_string());
        }
        Role::Paragraph | Role::Blockquote => {
            lines.push("英文は意味的に自然な単位で文分割してください。たとえ短い文でも、文とみなせれば独立させてください。".to_string());
            lines.push("ただし、分割の際に元の英文を1文字も変更しないでください。句読点や引用符も含めて全て保持してください。".to_string());
            if input.attempt >= 3 && quotation_mark_re().is_match(input.source_text) {
                lines.push("【重要】 翻訳対象には引用符が含まれています。それを絶対に消さないでください。".to_string());
            }
        }
        Role::Header => {
            lines.push("英文はヘッダなので、文分割は不要です。入力を1文として扱ってください。".to_string());
        }
        Role::List => {
            lines.push("英文はリストの項目なので、文分割は不要です。入力を1文として扱ってください。".to_string());
        }
        Role::Table => {
            lines.push("英文は \"|\" で区切られたテーブルの要素です。文分割は不要です。\"|\" は維持した上で、それ以外の中身を翻訳してください。".to_string());
        }
        Role::BookAuthor | Role::Code | Role::Macro => {}
    }
    lines.push("日本語訳は文体・語調に配慮しつつも、できるだけ直訳調にとどめ、構文や語順の対応関係が分かるようにしてください。".to_string());
    lines.push("context_hintは次の段落の翻訳時に役立つような背景情報を含めてください（例：誰が話しているか、舞台の変化、話題の推移など）。".to_string());
    lines.push("不要な解説や装飾、サマリー文などは含めず、必ず上記JSON構造のみを出力してください。".to_string());
    if input.attempt >= 2 {
        lines.push("JSONの書式には細心の注意を払ってください。引用符や括弧やカンマの仕様を厳密に守ってください。".to_string());
        lines.push("文分割の際に原文を変更しないでください。出力の \"en\" の値を連結すると原文と同じになるようにしてください。".to_string());
        lines.push(format!("過去のエラーによる現在の再試行回数={}", input.attempt - 1));
    }
    let extra_hint = input.extra_hint.trim();
    if !extra_hint.is_empty() {
        lines.push("----".to_string());
        lines.push(extra_hint.to_string());
    }
    lines.join("\n")
}

/// Instruction block for the syntactic-analysis prompt: output schema in
/// JSON-with-comments, classification vocabulary, and worked examples.
pub const ANALYZE_INSTRUCTIONS: &str = r#"
あなたは英文法の構文解析の試験を受けている学生です。
減点を防ぐため、英文法の規則に厳密に従って答えてください。例外的な判断や分析を加えず、教科書的なルールや分類に忠実に構文要素を分類してください。
JSON形式で複数の英文とその対訳が与えられます。それぞれの要素について、英文"source"を文単位に分解し、各文について構文を解析し、結果をJSON形式で追加してください。
出力は、List[List[Object]] 形式で、第1層のリストの要素は入力の各要素に対応します。入力の各要素には複数の文が含まれている可能性があり、それを文単位で分解したものが第2層のリストの要素になります。第2層の各要素はオブジェクトであり、構文解析の結果を含みます。

```pseudo-json
[
  [
    {
      "format": "sentence",
      "text": "入力の第1要素の文字列から抽出した1つめの英文",
      "pattern": "SVOC", // 文型分類: SV, SVO, SVC, SVOO, SVOC, other
      "elements": [
        { "type": "S", "text": "...", "translation": "..." },  // 主語の語句または節
        { "type": "V", "text": "...", "translation": "...",    // 動詞の語句または節
          "tense": "...", "aspect": "...", "mood": "...", "voice": "..." },
        { "type": "O", "text": "...", "translation": "..." },  // 目的語の語句または節
        { "type": "C", "text": "...", "translation": "..." },  // 補語の語句または節
        { "type": "M", "text": "...", "translation": "..." }   // 修飾語の語句または節
      ],
      "subclauses": [  // 文全体の副詞節はここに記述
        {
          "format": "clause",
          "text": "...",
          "relation": "...", // 従属節と主節の関係：content, cause, timeなど
          "pattern": "SV",
          "elements": [
            { "type": "S", "text": "...", "translation": "..." },
            { "type": "V", "text": "...", "translation": "...",
              "tense": "...", "aspect": "...", "mood": "...", "voice": "..." }
          ]
        }
      ],
      "subsentences": [  // 直接話法の副文はここに記述
        {
          "format": "sentence",
          "text": "...",
          "pattern": "SV",
          "elements": [
            { "type": "S", "text": "...", "translation": "..." },
            { "type": "V", "text": "...", "translation": "...",
              "tense": "...", "aspect": "...", "mood": "...", "voice": "..." }
          ]
        }
      ]
    }
  ]
]
```

出力はJSONのみで、余計な装飾やブラケットは省いてください。
必ず "format": "sentence" を各文のトップに含め、全体はJSONの2次元配列で返してください。入力の配列の要素数と出力の第1層の配列の要素数は同じになります。
各文の本文は "text" 属性として表現してください。英字だけでなく、引用符や句読点も含めた全ての文字を複写してください。複写した文字列は原文から一切の変更をしないでください。
文や節の文型 "pattern" は、 以下のいずれかで示します。
- SV : 動詞が自動詞で、目的語も補語も取らない。例：I ran quickly.
- SVO : 動詞が他動詞で、目的語を1つ取る。例：You ate a big apple quickly.
- SVC : 動詞がbe動詞などのlinking動詞で、補語を1つ取る。例：He is a popular teacher.
- SVOO : 動詞が他動詞で、目的語を2つ取る。例：She gave him chocolate.
- SVOC : 動詞が他動詞で、目的語を1つと補語1つを取る。例：You make me happy.
- other : 動詞を含まず、上記の5つに当てはまらないもの。例：Nice to meet you.
文や節の文型を構成する要素は "elements" の中に配列で示します。要素の種類 "type" は、S（主語）、V（動詞）、O（目的語）、C（補語）、M（修飾語）のいずれかで示します。
主語や目的語になれるのは、通常は名詞句だけです。補語になれるのは、通常は名詞句か形容詞句だけです。
名詞にかかる形容詞は名詞句に含めてください。動詞にかかる副詞は修飾語（M）として扱ってください。ただし、助動詞や句動詞は動詞句（V）に結合してください。倒置や慣用により位置が飛び飛びになっている動詞句も、結合して表現してください。
名詞にかかる不定詞句や動名詞句や前置詞句は形容詞句なので、それがかかる名詞と同じ要素に含めてください。動詞にかかる不定詞句や分詞構文や前置詞句は副詞句なので、修飾語として扱って下さい。
動詞句（V）には、"tense"（時制）と "aspect"（相）と "mood"（法）と "voice"（態）の分類を付けます。
"tense" は present か past から選びます。
"aspect" は simple か progressive か perfect か perfect progressive から選びます。
"mood" は indicative か imperative か subjunctive か conditional から選びます。
"voice" は active か passive か none から選びます。
各 "elements" オブジェクトには、構文要素の直訳を示す "translation" 属性を付加してください。これは "text" に対応する日本語訳であり、構文構成の意味を読解するための補助となります。翻訳は直訳調で構いません。入力の "target" を参考にしつつも、その要素の語句の辞書的な語義の範疇で最も文脈に合ったものを表現してください。
各 "element" の "text" の中にthat節、関係詞節、if節、whether節などの従属節が含まれる場合は、"subclauses" に分解して2階層目まで構文を分析してください。再帰させないでください。つまり、従属節の中の従属節は抽出しないでください。従属節として抽出した文字列も元の "text" に含めたままにして下さい。
文全体にかかる副詞節は、"elements" と並列の層に "subclauses" として抽出してください。
従属節の "relation" には、主節に対する従属節の関係を記述します。代表的な語彙は以下のものです。
- content : それ自体が名詞節で、動詞や形容詞の内容を表す節（that節など）。例：I heard that he won.
- apposition : 名詞を補足説明する同格節（that節など）。例：I know the news that he won.
- reason : 理由・原因を示す節（because節など）。例：I noticed it because it is red.
- condition : 条件を示す節（if節など）。例：I will buy it if it is cheap.
- supposition : 仮定を示す節（if節など）。例：If I were you, I would buy it.
- purpose : 目的を示す節（so that節など）。例：I stay here so that I can take care of him.
- result : 結果を示す節（so ... that節など）。例：It is so big that you can see it from here.
- contrast : 逆接・対比を示す節（although節など）。例：He bought it although it is expensive.
- concession : 譲歩を示す節（even if節など）。例：I'll go even if it rains.
- time : 時間を示す節（when節など）。例：I left home when the sun came up.
- place : 場所を示す節（where節など）。例：I live where the crime rate is low.
- manner : 様態・方法を示す節（as if節など）。例：He was sleeping as if he was dead.
- comparison : 比較を示す節（than節など）。例：She is taller than I am.
- extent : 程度を表す節（as節など）。例：She is as tall as he is.
節と句を区別してください。節とは主語と述語を含む文法構造であり、文型を持ちます。句はそうではありません。不定詞句や動名詞句は意味上の動詞を持ちますが、節にはならず、名詞句か形容詞句か副詞句になります。前置詞句は形容詞句か副詞句になります。
引用符を使った直接話法の副文を含む場合、"subsentences" に分解して2階層目まで構文を分析してください。再帰させないでください。つまり、副文の中の副文は抽出しないでください。副文として抽出した文字列も主文の "text" に含めたままにして下さい。
入力の "target" を構文解釈の参考として補助的に用いてください。意味的な整合性を高めるためのヒントとして使ってください。

典型的な入力例を示します。

```json
[
  {
    "source": "I studied hard because I wanted to pass, even though I was tired.",
    "target": "私は合格したかったので、一生懸命勉強しました。疲れていたにもかかわらず。"
  }
]
```

その出力例を示します。入力の配列の要素数が1つなので、それに対応して出力の第1層の配列の要素数は1つになります。また、入力の文が分解されなかったので、第2層の要素数も1つになります。

```json
[
  [
    {
      "format": "sentence",
      "text": "I studied hard because I wanted to pass, even though I was tired.",
      "pattern": "SVO",
      "elements": [
        { "type": "S", "text": "I", "translation": "私は" },
        { "type": "V", "text": "studied", "translation": "勉強した",
          "tense": "past", "aspect": "simple", "mood": "indicative", "voice": "active" },
        { "type": "M", "text": "hard", "translation": "一生懸命に" },
        {
          "type": "M",
          "text": "even though I was tired", "translation": "疲れていたけれど",
          "subclauses": [
            {
              "format": "clause",
              "text": "even though I was tired",
              "pattern": "SVC",
              "relation": "concession",
              "elements": [
                { "type": "M", "text": "even though", "translation": "〜だけれど" },
                { "type": "S", "text": "I", "translation": "私は" },
                { "type": "V", "text": "was", "translation": "状態だった",
                  "tense": "past", "aspect": "simple", "mood": "indicative", "voice": "none" },
                { "type": "C", "text": "tired", "translation": "疲れた" }
              ]
            }
          ]
        }
      ],
      "subclauses": [
        {
          "format": "clause",
          "text": "because I wanted to pass",
          "pattern": "SVO",
          "relation": "reason",
          "elements": [
            { "type": "M", "text": "because", "translation": "なぜなら" },
            { "type": "S", "text": "I", "translation": "私は" },
            { "type": "V", "text": "wanted", "translation": "欲した",
              "tense": "past", "aspect": "simple", "mood": "indicative", "voice": "active" },
            { "type": "O", "text": "to pass", "translation": "合格することを" }
          ]
        }
      ]
    }
  ]
]
```

2つの要素を含む入力例を示します。

```json
[
  {
    "source": "He loved linguistics.",
    "target": "彼は言語学を好んだ。"
  },
  {
    "source": "It gave him wisdom.",
    "target": "それは彼に知恵を与えた。"
  }
]
```

その出力例を示します。入力の配列の要素数が2つなので、それに対応して出力の第1層の配列の要素数は2つになります。また、入力の文が分解されなかったので、第2層の要素数は1つになります。

```json
[
  [
    {
      "format": "sentence",
      "text": "He loved linguistics.",
      "pattern": "SVO",
      "elements": [
        { "type": "S", "text": "He", "translation": "彼は" },
        { "type": "V", "text": "loved", "translation": "好んだ",
          "tense": "past", "aspect": "simple", "mood": "indicative", "voice": "active" },
        { "type": "O", "text": "linguistics", "translation": "言語学を" }
      ]
    }
  ],
  [
    {
      "format": "sentence",
      "text": "It gave him wisdom.",
      "pattern": "SVOO",
      "elements": [
        { "type": "S", "text": "It", "translation": "それは" },
        { "type": "V", "text": "gave", "translation": "与えた",
          "tense": "past", "aspect": "simple", "mood": "indicative", "voice": "active" },
        { "type": "O", "text": "him", "translation": "彼に" },
        { "type": "O", "text": "wisdom", "translation": "知恵を" }
      ]
    }
  ]
]
```

"pattern" が示す文型と "elements" の各要素の "type" の対応関係には注意して下さい。文型が "SV" の場合、"type" は "S" と "V" が存在する必要があり、"O" や "C" は存在してはいけません。文型が "SVO" の場合、"S" と "V" と "O" が存在し、"C" は存在してはいけません。文型が "SVC" の場合、"S" と "V" と "C" が存在し、"O" は存在してはいけません。文型が "SVOO" の場合、"S" と "V" と "O" 2つが存在し、"C" は存在してはいけません。文型が "SVOC" の場合、"S" と "V" と "O" と "C" が存在する必要があります。"M" はどの文型でいくつ存在しても構いません。そうしないと減点されます。
副詞節は "subclauses" として独立させてください。副詞句は "elements" として独立させてください。副詞句である不定詞句や前置詞句は、動詞や補語からは分離してください。そうしないと減点されます。
"#;

/// The syntactic-analysis prompt over one token-bounded pair batch. With
/// `use_source_example` the prompt echoes the actual sources, pre-split
/// into sentences, as a schema-shaped skeleton.
pub fn build_analysis_prompt(
    pairs: &[TranslationPair],
    extra_hint: &str,
    use_source_example: bool,
) -> String {
    let mut lines: Vec<String> = Vec::new();
    lines.push(ANALYZE_INSTRUCTIONS.trim().to_string());
    lines.push("----".to_string());
    lines.push("以下の情報をもとに、インストラクションの指示に従って構文解析を行ってください。".to_string());
    lines.push("----".to_string());
    lines.push(serde_json::to_string_pretty(&json!(pairs)).unwrap_or_default());
    if use_source_example {
        lines.push("----".to_string());
        lines.push("出力例を示します。".to_string());
        let example: Vec<Value> = pairs
            .iter()
            .map(|pair| {
                let items: Vec<Value> = split_sentences(&pair.source)
                    .iter()
                    .map(|sentence| {
                        json!({
                            "format": "sentence",
                            "text": sentence,
                            "pattern": "...",
                            "elements": [
                                {"type": "...", "text": "...", "translation": "..."},
                                {"type": "...", "text": "...", "translation": "...",
                                 "tense": "...", "aspect": "...", "mood": "...", "voice": "..."},
                            ],
                        })
                    })
                    .collect();
                Value::Array(items)
            })
            .collect();
        lines.push(serde_json::to_string_pretty(&Value::Array(example)).unwrap_or_default());
    }
    let extra_hint = extra_hint.trim();
    if !extra_hint.is_empty() {
        lines.push("----".to_string());
        lines.push(extra_hint.to_string());
    }
    lines.join("\n")
}
